//! Demo tools, resources, prompt and completions served by the binary.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::mcp::handler::{
    get_int_arg, get_string_arg, Arguments, AsyncToolHandler, CompletionHandler, ResourceHandler,
    ToolContext, ToolHandler,
};
use crate::mcp::tasks::TaskHandle;
use crate::types::{
    CompletionArgument, CompletionReference, CompletionResult, ResourceContents, Tool, ToolResult,
};
use crate::VERSION;

/// Echo tool.
pub struct EchoTool;

impl EchoTool {
    pub fn definition() -> Tool {
        Tool::new("echo", "Return the given text unchanged.").with_input_schema(json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Text to echo back"
                }
            },
            "required": ["text"]
        }))
    }
}

#[async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, args: Arguments, ctx: ToolContext) -> Result<ToolResult> {
        let text = get_string_arg(&args, "text")?;
        if let Some(progress) = &ctx.progress {
            progress.report(1.0, Some("echoed")).await?;
        }
        Ok(ToolResult::text(text))
    }
}

/// Echo after a delay, run as a task.
pub struct DelayedEchoTool {
    default_delay: Duration,
}

impl DelayedEchoTool {
    pub fn new(default_delay: Duration) -> Self {
        Self { default_delay }
    }

    pub fn definition() -> Tool {
        Tool::new(
            "delayed_echo",
            "Echo text after a delay. Runs as a task; poll it with tasks/get and tasks/result.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Text to echo back"
                },
                "delay_ms": {
                    "type": "integer",
                    "description": "Milliseconds to wait before answering"
                }
            },
            "required": ["text"]
        }))
    }
}

impl Default for DelayedEchoTool {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl AsyncToolHandler for DelayedEchoTool {
    async fn start(&self, args: Arguments, task: TaskHandle) -> Result<Option<ToolResult>> {
        let text = get_string_arg(&args, "text")?;
        let delay = match get_int_arg(&args, "delay_ms") {
            Ok(ms) => Duration::from_millis(ms.max(0) as u64),
            Err(_) => self.default_delay,
        };
        if delay.is_zero() {
            return Ok(Some(ToolResult::text(text)));
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = task.cancelled() => debug!("delayed_echo task {} cancelled", task.id()),
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = task.complete(ToolResult::text(text)) {
                        debug!("delayed_echo task {} not completed: {}", task.id(), e);
                    }
                }
            }
        });
        Ok(None)
    }
}

/// Static resource describing this server.
pub struct AboutResource;

impl AboutResource {
    pub const URI: &'static str = "engine://about";
}

#[async_trait]
impl ResourceHandler for AboutResource {
    async fn read(
        &self,
        uri: &str,
        _variables: &HashMap<String, String>,
    ) -> Result<Vec<ResourceContents>> {
        let body = json!({ "name": "mcp-engine", "version": VERSION });
        let mut contents = ResourceContents::text(uri, serde_json::to_string_pretty(&body)?);
        contents.mime_type = Some("application/json".to_string());
        Ok(vec![contents])
    }
}

/// `echo://{message}` template: the message comes back as the contents.
pub struct EchoResource;

impl EchoResource {
    pub const TEMPLATE: &'static str = "echo://{message}";
}

#[async_trait]
impl ResourceHandler for EchoResource {
    async fn read(
        &self,
        uri: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Vec<ResourceContents>> {
        Ok(variables
            .get("message")
            .map(|message| vec![ResourceContents::text(uri, message.clone())])
            .unwrap_or_default())
    }
}

/// Suggests names for the `greeting` prompt.
pub struct GreetingCompletion {
    names: Vec<String>,
}

impl GreetingCompletion {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

impl Default for GreetingCompletion {
    fn default() -> Self {
        Self::new(
            ["Ada", "Alan", "Barbara", "Edsger", "Grace", "Ken"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

#[async_trait]
impl CompletionHandler for GreetingCompletion {
    async fn complete(
        &self,
        reference: &CompletionReference,
        argument: &CompletionArgument,
    ) -> Result<CompletionResult> {
        let wants_names = matches!(reference, CompletionReference::Prompt { name } if name == "greeting")
            && argument.name.as_deref().map_or(true, |n| n == "name");
        if !wants_names {
            return Ok(CompletionResult::default());
        }

        let prefix = argument.value.to_lowercase();
        let values: Vec<String> = self
            .names
            .iter()
            .filter(|n| n.to_lowercase().starts_with(&prefix))
            .cloned()
            .collect();
        Ok(CompletionResult {
            total: Some(values.len() as u32),
            values,
            has_more: false,
        })
    }
}
