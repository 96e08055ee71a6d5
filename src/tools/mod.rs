//! Built-in demo capabilities.
//!
//! - `echo` - synchronous tool, reports progress when asked
//! - `delayed_echo` - asynchronous tool backed by a task
//! - `engine://about` - static resource
//! - `echo://{message}` - resource template
//! - `greeting` - prompt with a completable `name` argument

pub mod demo;

use std::sync::Arc;

use crate::error::Result;
use crate::mcp::prompts::TemplatePrompt;
use crate::mcp::server::Server;
use crate::types::{Prompt, Resource, ResourceTemplate};

pub use demo::{AboutResource, DelayedEchoTool, EchoResource, EchoTool, GreetingCompletion};

/// Register every demo capability on `server`.
pub fn register_all_tools(server: &Server) -> Result<()> {
    server.add_tool(EchoTool::definition(), Arc::new(EchoTool));
    server.add_async_tool(
        DelayedEchoTool::definition(),
        Arc::new(DelayedEchoTool::default()),
    );

    server.add_resource(
        Resource::new(AboutResource::URI, "about")
            .with_description("Name and version of this server")
            .with_mime_type("application/json"),
        Arc::new(AboutResource),
    );
    server.add_resource_template(
        ResourceTemplate::new(EchoResource::TEMPLATE, "echo"),
        Arc::new(EchoResource),
    )?;

    server.add_prompt(
        Prompt::new("greeting", "Greet someone by name").with_argument(
            "name",
            "Who to greet",
            true,
        ),
        Arc::new(TemplatePrompt::new(
            "Please write a short, friendly greeting for {{name}}.",
        )),
    );
    server.set_completion_handler(Arc::new(GreetingCompletion::default()));
    Ok(())
}
