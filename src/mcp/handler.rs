//! Handler traits the server dispatches to, and the tool registry.
//!
//! Embedders implement the traits directly or wrap closures with
//! [`tool_fn`], [`async_tool_fn`], [`resource_fn`], [`prompt_fn`] and
//! [`completion_fn`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::progress::ProgressReporter;
use crate::mcp::protocol::RequestId;
use crate::mcp::server::Server;
use crate::mcp::tasks::TaskHandle;
use crate::types::{
    CompletionArgument, CompletionReference, CompletionResult, PromptResult, ResourceContents,
    Tool, ToolResult,
};

/// Tool call arguments.
pub type Arguments = Map<String, Value>;

/// What a tool handler gets besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub request_id: RequestId,
    /// Present when the caller supplied a progress token.
    pub progress: Option<ProgressReporter>,
    /// Cancelled when the caller sends `notifications/cancelled`.
    pub cancellation: CancellationToken,
    /// The server handling the call; lets a tool issue sampling or roots requests.
    pub server: Server,
}

/// Handler for a tool that answers within the call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Arguments, ctx: ToolContext) -> Result<ToolResult>;
}

/// Handler for a tool whose calls run as tasks.
///
/// Returning `Some` finishes the task immediately. Returning `None` leaves it
/// `working`; the handler then completes it through the [`TaskHandle`].
#[async_trait]
pub trait AsyncToolHandler: Send + Sync {
    async fn start(&self, arguments: Arguments, task: TaskHandle) -> Result<Option<ToolResult>>;
}

/// Reads a resource, given the URI and any variables captured by its template.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(
        &self,
        uri: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Vec<ResourceContents>>;

    async fn subscribe(&self, _uri: &str) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _uri: &str) -> Result<()> {
        Ok(())
    }
}

/// Renders a prompt from its flattened arguments.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(&self, arguments: HashMap<String, String>) -> Result<PromptResult>;
}

/// Suggests values for a prompt or resource-template argument.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn complete(
        &self,
        reference: &CompletionReference,
        argument: &CompletionArgument,
    ) -> Result<CompletionResult>;
}

// ===== Closure adapters =====

struct ToolFn<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for ToolFn<F>
where
    F: Fn(Arguments, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    async fn call(&self, arguments: Arguments, ctx: ToolContext) -> Result<ToolResult> {
        (self.0)(arguments, ctx).await
    }
}

pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Arguments, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    Arc::new(ToolFn(f))
}

struct AsyncToolFn<F>(F);

#[async_trait]
impl<F, Fut> AsyncToolHandler for AsyncToolFn<F>
where
    F: Fn(Arguments, TaskHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<ToolResult>>> + Send + 'static,
{
    async fn start(&self, arguments: Arguments, task: TaskHandle) -> Result<Option<ToolResult>> {
        (self.0)(arguments, task).await
    }
}

pub fn async_tool_fn<F, Fut>(f: F) -> Arc<dyn AsyncToolHandler>
where
    F: Fn(Arguments, TaskHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<ToolResult>>> + Send + 'static,
{
    Arc::new(AsyncToolFn(f))
}

struct ResourceFn<F>(F);

#[async_trait]
impl<F, Fut> ResourceHandler for ResourceFn<F>
where
    F: Fn(String, HashMap<String, String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
{
    async fn read(
        &self,
        uri: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Vec<ResourceContents>> {
        (self.0)(uri.to_string(), variables.clone()).await
    }
}

pub fn resource_fn<F, Fut>(f: F) -> Arc<dyn ResourceHandler>
where
    F: Fn(String, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
{
    Arc::new(ResourceFn(f))
}

struct PromptFn<F>(F);

#[async_trait]
impl<F, Fut> PromptHandler for PromptFn<F>
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PromptResult>> + Send + 'static,
{
    async fn get(&self, arguments: HashMap<String, String>) -> Result<PromptResult> {
        (self.0)(arguments).await
    }
}

pub fn prompt_fn<F, Fut>(f: F) -> Arc<dyn PromptHandler>
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PromptResult>> + Send + 'static,
{
    Arc::new(PromptFn(f))
}

struct CompletionFn<F>(F);

#[async_trait]
impl<F, Fut> CompletionHandler for CompletionFn<F>
where
    F: Fn(CompletionReference, CompletionArgument) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CompletionResult>> + Send + 'static,
{
    async fn complete(
        &self,
        reference: &CompletionReference,
        argument: &CompletionArgument,
    ) -> Result<CompletionResult> {
        (self.0)(reference.clone(), argument.clone()).await
    }
}

pub fn completion_fn<F, Fut>(f: F) -> Arc<dyn CompletionHandler>
where
    F: Fn(CompletionReference, CompletionArgument) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CompletionResult>> + Send + 'static,
{
    Arc::new(CompletionFn(f))
}

// ===== Tool registry =====

/// The handlers registered for one tool.
#[derive(Clone, Default)]
pub struct ToolEntry {
    pub handler: Option<Arc<dyn ToolHandler>>,
    pub async_handler: Option<Arc<dyn AsyncToolHandler>>,
}

/// Registered tools, listed in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<(Tool, ToolEntry)>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tool. A replaced tool keeps its position.
    pub fn register(&self, tool: Tool, entry: ToolEntry) {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        match tools.iter_mut().find(|(t, _)| t.name == tool.name) {
            Some(slot) => *slot = (tool, entry),
            None => tools.push((tool, entry)),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let before = tools.len();
        tools.retain(|(t, _)| t.name != name);
        tools.len() != before
    }

    pub fn list(&self) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ToolEntry> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(t, _)| t.name == name)
            .map(|(_, entry)| entry.clone())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ===== Argument helpers =====

/// Helper to extract a required string argument.
pub fn get_string_arg(args: &Arguments, name: &str) -> Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::InvalidParams(format!("Missing required argument: {}", name)))
}

/// Helper to extract an optional string argument.
pub fn get_optional_string_arg(args: &Arguments, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(String::from)
}

/// Helper to extract a required integer argument.
pub fn get_int_arg(args: &Arguments, name: &str) -> Result<i64> {
    args.get(name)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::InvalidParams(format!("Missing required argument: {}", name)))
}

/// Helper to extract a boolean argument with a default.
pub fn get_bool_arg(args: &Arguments, name: &str, default: bool) -> bool {
    args.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(Tool::new(name, "test"), ToolEntry::default());
        }
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_registry_replace_and_remove() {
        let registry = ToolRegistry::new();
        registry.register(Tool::new("a", "first"), ToolEntry::default());
        registry.register(Tool::new("b", "second"), ToolEntry::default());
        registry.register(Tool::new("a", "replaced"), ToolEntry::default());

        let tools = registry.list();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].description.as_deref(), Some("replaced"));

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(!registry.has_tool("a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_async_tool_closure() {
        let handler = async_tool_fn(|args: Arguments, task: TaskHandle| async move {
            let text = get_string_arg(&args, "text")?;
            task.complete(ToolResult::text(text.clone()))?;
            Ok::<_, Error>(None)
        });

        let store = crate::mcp::tasks::TaskStore::new();
        let task = store.create(None, None);
        let outcome = handler
            .start(
                args(json!({"text": "later"})),
                TaskHandle::new(store.clone(), &task.task_id),
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(
            store.result(&task.task_id).unwrap().content[0].as_text(),
            Some("later")
        );
    }

    #[tokio::test]
    async fn test_resource_closure_receives_variables() {
        let handler = resource_fn(|uri: String, vars: HashMap<String, String>| async move {
            Ok(vec![ResourceContents::text(uri, vars["path"].clone())])
        });
        let mut vars = HashMap::new();
        vars.insert("path".to_string(), "a/b.txt".to_string());

        let contents = handler.read("file:///a/b.txt", &vars).await.unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("a/b.txt"));
        assert!(handler.subscribe("file:///a/b.txt").await.is_ok());
    }

    #[test]
    fn test_get_string_arg() {
        let args = args(json!({"name": "value"}));
        assert_eq!(get_string_arg(&args, "name").unwrap(), "value");
        assert!(matches!(
            get_string_arg(&args, "missing"),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_get_optional_string_arg() {
        let args = args(json!({"name": "value"}));
        assert_eq!(
            get_optional_string_arg(&args, "name"),
            Some("value".to_string())
        );
        assert_eq!(get_optional_string_arg(&args, "missing"), None);
    }

    #[test]
    fn test_get_int_arg() {
        let args = args(json!({"count": 42}));
        assert_eq!(get_int_arg(&args, "count").unwrap(), 42);
        assert!(get_int_arg(&args, "missing").is_err());
    }

    #[test]
    fn test_get_bool_arg() {
        let args = args(json!({"flag": true}));
        assert!(get_bool_arg(&args, "flag", false));
        assert!(!get_bool_arg(&args, "missing", false));
        assert!(get_bool_arg(&args, "missing", true));
    }
}
