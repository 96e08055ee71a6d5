//! Model Context Protocol (MCP) implementation.
//!
//! # Architecture
//!
//! - `protocol` - JSON-RPC envelopes, handshake records, method names, codes
//! - `codec` - envelope classification and NDJSON framing
//! - `session` - lifecycle state machine and pending-request correlation
//! - `client` / `server` - the two protocol roles over a [`Session`]
//! - `handler` - traits the server dispatches to, plus the tool registry
//! - `resources` / `prompts` - resource and prompt registries
//! - `uri_template` - `{name}` placeholder matching for resource templates
//! - `progress` - progress notifications
//! - `tasks` - task records for asynchronous tool calls

pub mod client;
pub mod codec;
pub mod handler;
pub mod progress;
pub mod prompts;
pub mod protocol;
pub mod resources;
pub mod server;
pub mod session;
pub mod tasks;
pub mod uri_template;

pub use client::{Client, ClientConfig, ClientEvent};
pub use codec::Message;
pub use handler::{
    async_tool_fn, completion_fn, prompt_fn, resource_fn, tool_fn, Arguments, AsyncToolHandler,
    CompletionHandler, PromptHandler, ResourceHandler, ToolContext, ToolHandler,
};
pub use protocol::*;
pub use server::{Server, ServerConfig, ServerEvent};
pub use session::{Session, SessionState};
pub use tasks::{TaskHandle, TaskStore};
