//! MCP Engine - Model Context Protocol sessions in Rust
//!
//! A library for running either side of a Model Context Protocol session:
//! a [`Client`](mcp::Client) that connects to servers, and a
//! [`Server`](mcp::Server) that exposes tools, resources and prompts.
//!
//! # Architecture
//!
//! 1. **Transport Layer** (`transport`) - stdio, HTTP+SSE, WebSocket and Unix
//!    socket transports behind one [`Transport`](transport::Transport) trait
//! 2. **Session Layer** (`mcp::session`) - lifecycle, request correlation,
//!    cancellation
//! 3. **Role Layer** (`mcp::client`, `mcp::server`) - handshake, dispatch,
//!    role reversal (sampling, roots)
//! 4. **Records** (`types`) - tools, resources, prompts, tasks and friends
//!
//! The `mcp-engine` binary serves a small demo server over any transport.

pub mod config;
pub mod error;
pub mod mcp;
pub mod metrics;
pub mod tools;
pub mod transport;
pub mod types;

pub use error::{Error, Result};

/// Crate version, announced in `serverInfo` / `clientInfo`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
