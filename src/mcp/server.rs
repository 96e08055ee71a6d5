//! MCP server implementation.
//!
//! A [`Server`] owns one [`Session`] and the registries it dispatches to.
//! `initialize` is answered inline by the session event loop; every other
//! request runs on its own task with a [`CancellationToken`] the client can
//! trip through `notifications/cancelled`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::handler::{
    AsyncToolHandler, CompletionHandler, PromptHandler, ResourceHandler, ToolContext, ToolEntry,
    ToolHandler, ToolRegistry,
};
use crate::mcp::progress::{ProgressReporter, ProgressToken};
use crate::mcp::prompts::{flatten_arguments, PromptRegistry};
use crate::mcp::protocol::*;
use crate::mcp::resources::ResourceRegistry;
use crate::mcp::session::{spawn_event_loop, Role, Session, SessionPeer, SessionState};
use crate::mcp::tasks::{TaskHandle, TaskStore};
use crate::metrics::Metrics;
use crate::transport::{lock, Transport, TransportState};
use crate::types::{
    CallToolParams, CompleteParams, CompleteResult, CreateMessageParams, CreateMessageResult,
    GetPromptParams, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListRootsResult, ListTasksResult, ListToolsResult, Prompt, ReadResourceResult, Resource,
    ResourceTemplate, ResourceUriParams, Root, TaskIdParams, Tool, ToolResult,
};
use crate::VERSION;

/// Static server settings announced during the handshake.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_info: Implementation,
    pub instructions: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new("mcp-engine", VERSION),
            instructions: None,
        }
    }
}

/// What the client told us during `initialize`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    pub protocol_version: String,
}

/// Lifecycle events surfaced to the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The client sent `notifications/initialized`.
    Ready,
    /// The client changed its roots.
    RootsListChanged,
    /// The session ended.
    Closed(SessionState),
}

struct Inner {
    config: ServerConfig,
    session: Arc<Session>,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    completion: Mutex<Option<Arc<dyn CompletionHandler>>>,
    tasks: Arc<TaskStore>,
    log_level: Mutex<Option<LoggingLevel>>,
    peer: Mutex<Option<PeerInfo>>,
    initialize_seen: AtomicBool,
    /// In-flight inbound requests.
    active: DashMap<RequestId, CancellationToken>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// MCP server bound to one transport.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, config: ServerConfig) -> Self {
        Self::with_metrics(transport, config, Metrics::new())
    }

    /// Create a server that reports into a shared metrics collector.
    pub fn with_metrics(
        transport: Arc<dyn Transport>,
        config: ServerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                session: Arc::new(Session::new(Role::Server, transport, metrics)),
                tools: ToolRegistry::new(),
                resources: ResourceRegistry::new(),
                prompts: PromptRegistry::new(),
                completion: Mutex::new(None),
                tasks: TaskStore::new(),
                log_level: Mutex::new(None),
                peer: Mutex::new(None),
                initialize_seen: AtomicBool::new(false),
                active: DashMap::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                event_loop: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.inner.resources
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.inner.prompts
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.inner.tasks
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.inner.session.metrics()
    }

    /// Client info, capabilities and negotiated version, once initialized.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        lock(&self.inner.peer).clone()
    }

    /// Minimum level for log notifications, as set by the client.
    pub fn log_level(&self) -> Option<LoggingLevel> {
        *lock(&self.inner.log_level)
    }

    /// Lifecycle events, handed out once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        lock(&self.inner.events_rx).take()
    }

    // ===== Registration =====

    pub fn add_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) {
        self.register_tool(
            tool,
            ToolEntry {
                handler: Some(handler),
                async_handler: None,
            },
        );
    }

    /// Register a tool whose calls run as tasks.
    pub fn add_async_tool(&self, tool: Tool, handler: Arc<dyn AsyncToolHandler>) {
        self.register_tool(
            tool,
            ToolEntry {
                handler: None,
                async_handler: Some(handler),
            },
        );
    }

    pub fn register_tool(&self, tool: Tool, entry: ToolEntry) {
        debug!("registering tool {}", tool.name);
        self.inner.tools.register(tool, entry);
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        self.inner.tools.remove(name)
    }

    pub fn add_resource(&self, resource: Resource, handler: Arc<dyn ResourceHandler>) {
        self.inner.resources.add_resource(resource, handler);
    }

    pub fn add_resource_template(
        &self,
        template: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<()> {
        self.inner.resources.add_template(template, handler)
    }

    pub fn add_prompt(&self, prompt: Prompt, handler: Arc<dyn PromptHandler>) {
        self.inner.prompts.register(prompt, handler);
    }

    pub fn set_completion_handler(&self, handler: Arc<dyn CompletionHandler>) {
        *lock(&self.inner.completion) = Some(handler);
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            resources: Some(ResourcesCapability {
                subscribe: true,
                list_changed: true,
            }),
            prompts: Some(PromptsCapability { list_changed: true }),
            logging: Some(LoggingCapability {}),
            completions: lock(&self.inner.completion)
                .as_ref()
                .map(|_| CompletionsCapability {}),
            tasks: Some(TasksCapability {
                list: Some(json!({})),
                cancel: Some(json!({})),
            }),
            experimental: None,
        }
    }

    // ===== Lifecycle =====

    /// Connect the transport if needed, start the event loop and wait until
    /// the client finished the handshake.
    pub async fn start(&self) -> Result<()> {
        let session = self.inner.session.clone();
        let transport = session.transport().clone();
        let events = transport
            .take_events()
            .ok_or_else(|| Error::Internal("server already started".to_string()))?;

        let mut state = session.subscribe_state();
        session.set_state(SessionState::Connecting)?;
        session.metrics().session_opened();

        if let Some(updates) = self.inner.tasks.take_updates() {
            tokio::spawn(forward_task_updates(session.clone(), updates));
        }
        *lock(&self.inner.event_loop) = Some(spawn_event_loop(self.clone(), events));

        if transport.state() == TransportState::Disconnected {
            if let Err(e) = transport.connect().await {
                session.terminate(SessionState::Error, &e.to_string());
                self.finish(SessionState::Error);
                return Err(e);
            }
        }
        info!(
            "MCP server {} v{} listening on {}",
            self.inner.config.server_info.name,
            self.inner.config.server_info.version,
            transport.kind()
        );

        loop {
            let current = *state.borrow_and_update();
            if current == SessionState::Ready {
                return Ok(());
            }
            if session.is_terminated() {
                return Err(Error::ConnectionClosed(format!(
                    "session {} before the handshake finished",
                    current
                )));
            }
            if state.changed().await.is_err() {
                return Err(Error::ConnectionClosed("session dropped".to_string()));
            }
        }
    }

    /// Resolves with the terminal state once the session ended.
    pub async fn closed(&self) -> SessionState {
        let session = &self.inner.session;
        let mut state = session.subscribe_state();
        loop {
            let current = *state.borrow_and_update();
            if session.is_terminated()
                && matches!(current, SessionState::Disconnected | SessionState::Error)
            {
                return current;
            }
            if state.changed().await.is_err() {
                return session.state();
            }
        }
    }

    /// Close the session and the transport.
    pub async fn stop(&self) -> Result<()> {
        let session = &self.inner.session;
        if session.is_terminated() {
            return Ok(());
        }
        let _ = session.set_state(SessionState::Closing);
        self.cancel_active();

        let result = session.transport().disconnect().await;
        session.terminate(SessionState::Disconnected, "server stopped");
        self.finish(SessionState::Disconnected);

        let handle = lock(&self.inner.event_loop).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        info!("MCP server stopped");
        result
    }

    fn cancel_active(&self) {
        for entry in self.inner.active.iter() {
            entry.value().cancel();
        }
        self.inner.active.clear();
    }

    fn finish(&self, state: SessionState) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.metrics().session_closed();
        let _ = self.inner.events_tx.send(ServerEvent::Closed(state));
    }

    // ===== Outbound notifications =====

    async fn notify_when_ready(&self, method: &str, params: Option<Value>) -> Result<bool> {
        if !self.inner.session.is_ready() {
            debug!("not sending {}: session is {}", method, self.state());
            return Ok(false);
        }
        self.inner.session.notify(method, params).await?;
        Ok(true)
    }

    pub async fn notify_tools_list_changed(&self) -> Result<bool> {
        self.notify_when_ready(methods::NOTIFY_TOOLS_LIST_CHANGED, None)
            .await
    }

    pub async fn notify_resources_list_changed(&self) -> Result<bool> {
        self.notify_when_ready(methods::NOTIFY_RESOURCES_LIST_CHANGED, None)
            .await
    }

    pub async fn notify_prompts_list_changed(&self) -> Result<bool> {
        self.notify_when_ready(methods::NOTIFY_PROMPTS_LIST_CHANGED, None)
            .await
    }

    /// Announce a change to `uri`. Only subscribed URIs are announced.
    pub async fn notify_resource_updated(&self, uri: &str) -> Result<bool> {
        if !self.inner.resources.is_subscribed(uri) {
            debug!("no subscriber for {}", uri);
            return Ok(false);
        }
        let params = serde_json::to_value(ResourceUriParams {
            uri: uri.to_string(),
        })?;
        self.notify_when_ready(methods::NOTIFY_RESOURCE_UPDATED, Some(params))
            .await
    }

    /// Send a log notification if `level` reaches the client's minimum.
    pub async fn log_message(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> Result<bool> {
        if let Some(min) = self.log_level() {
            if level < min {
                return Ok(false);
            }
        }
        let params = serde_json::to_value(LoggingMessageParams {
            level,
            logger: logger.map(String::from),
            data,
        })?;
        self.notify_when_ready(methods::NOTIFY_MESSAGE, Some(params))
            .await
    }

    /// Progress reporter for a caller-supplied token.
    pub fn progress_reporter(&self, token: ProgressToken, total: Option<f64>) -> ProgressReporter {
        ProgressReporter::new(token, total, self.inner.session.clone())
    }

    // ===== Requests to the client =====

    fn client_capabilities(&self) -> ClientCapabilities {
        lock(&self.inner.peer)
            .as_ref()
            .map(|p| p.capabilities.clone())
            .unwrap_or_default()
    }

    /// Ask the client to sample from its model.
    pub async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        if self.client_capabilities().sampling.is_none() {
            return Err(Error::CapabilityNotSupported("sampling".to_string()));
        }
        let value = self
            .inner
            .session
            .request(
                methods::SAMPLING_CREATE_MESSAGE,
                Some(serde_json::to_value(params)?),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ask the client for its roots.
    pub async fn list_roots(&self) -> Result<Vec<Root>> {
        if self.client_capabilities().roots.is_none() {
            return Err(Error::CapabilityNotSupported("roots".to_string()));
        }
        let value = self
            .inner
            .session
            .request(methods::ROOTS_LIST, None)
            .await?;
        let result: ListRootsResult = serde_json::from_value(value)?;
        Ok(result.roots)
    }

    pub async fn ping(&self) -> Result<()> {
        self.inner.session.request(methods::PING, None).await?;
        Ok(())
    }

    // ===== Inbound handling =====

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value> {
        let params: InitializeParams = parse_params(params)?;
        if self.inner.initialize_seen.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let protocol_version = if is_supported_version(&params.protocol_version) {
            params.protocol_version.clone()
        } else {
            warn!(
                "client asked for protocol {}, answering with {}",
                params.protocol_version, LATEST_PROTOCOL_VERSION
            );
            LATEST_PROTOCOL_VERSION.to_string()
        };

        info!(
            "Client connected: {} v{} (protocol {})",
            params.client_info.name, params.client_info.version, protocol_version
        );
        *lock(&self.inner.peer) = Some(PeerInfo {
            client_info: params.client_info,
            capabilities: params.capabilities,
            protocol_version: protocol_version.clone(),
        });
        self.inner.session.set_state(SessionState::Initializing)?;

        let result = InitializeResult {
            protocol_version,
            capabilities: self.capabilities(),
            server_info: self.inner.config.server_info.clone(),
            instructions: self.inner.config.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn reply(&self, id: RequestId, result: Result<Value>) {
        if let Err(e) = self.inner.session.respond(id.clone(), result).await {
            warn!("could not answer request {}: {}", id, e);
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest, cancel: CancellationToken) -> Result<Value> {
        debug!("Handling request: {} (id: {})", request.method, request.id);
        let params = request.params;

        match request.method.as_str() {
            methods::PING => Ok(json!({})),

            methods::TOOLS_LIST => Ok(serde_json::to_value(ListToolsResult {
                tools: self.inner.tools.list(),
                next_cursor: None,
            })?),
            methods::TOOLS_CALL => self.call_tool(request.id, params, cancel).await,

            methods::RESOURCES_LIST => Ok(serde_json::to_value(ListResourcesResult {
                resources: self.inner.resources.list_resources(),
                next_cursor: None,
            })?),
            methods::RESOURCES_TEMPLATES_LIST => {
                Ok(serde_json::to_value(ListResourceTemplatesResult {
                    resource_templates: self.inner.resources.list_templates(),
                    next_cursor: None,
                })?)
            }
            methods::RESOURCES_READ => {
                let params: ResourceUriParams = parse_params(params)?;
                let contents = self.inner.resources.read(&params.uri).await?;
                Ok(serde_json::to_value(ReadResourceResult { contents })?)
            }
            methods::RESOURCES_SUBSCRIBE => {
                let params: ResourceUriParams = parse_params(params)?;
                self.inner.resources.subscribe(&params.uri).await?;
                Ok(json!({}))
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                let params: ResourceUriParams = parse_params(params)?;
                self.inner.resources.unsubscribe(&params.uri).await?;
                Ok(json!({}))
            }

            methods::PROMPTS_LIST => Ok(serde_json::to_value(ListPromptsResult {
                prompts: self.inner.prompts.list(),
                next_cursor: None,
            })?),
            methods::PROMPTS_GET => {
                let params: GetPromptParams = parse_params(params)?;
                let arguments = flatten_arguments(params.arguments.as_ref());
                let result = self.inner.prompts.get(&params.name, arguments).await?;
                Ok(serde_json::to_value(result)?)
            }

            methods::COMPLETION_COMPLETE => {
                let params: CompleteParams = parse_params(params)?;
                let handler = lock(&self.inner.completion).clone();
                let completion = match handler {
                    Some(handler) => handler.complete(&params.reference, &params.argument).await?,
                    None => Default::default(),
                };
                Ok(serde_json::to_value(CompleteResult { completion })?)
            }

            methods::LOGGING_SET_LEVEL => {
                let params: SetLevelParams = parse_params(params)?;
                debug!("client log level set to {:?}", params.level);
                *lock(&self.inner.log_level) = Some(params.level);
                Ok(json!({}))
            }

            methods::TASKS_GET => {
                let params: TaskIdParams = parse_params(params)?;
                Ok(serde_json::to_value(self.inner.tasks.get(&params.task_id)?)?)
            }
            methods::TASKS_RESULT => {
                let params: TaskIdParams = parse_params(params)?;
                Ok(serde_json::to_value(self.inner.tasks.result(&params.task_id)?)?)
            }
            methods::TASKS_CANCEL => {
                let params: TaskIdParams = parse_params(params)?;
                Ok(serde_json::to_value(self.inner.tasks.cancel(&params.task_id)?)?)
            }
            methods::TASKS_LIST => Ok(serde_json::to_value(ListTasksResult {
                tasks: self.inner.tasks.list(),
                next_cursor: None,
            })?),

            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    async fn call_tool(
        &self,
        request_id: RequestId,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let params: CallToolParams = parse_params(params)?;
        let entry = self
            .inner
            .tools
            .get(&params.name)
            .ok_or_else(|| Error::ToolNotFound(params.name.clone()))?;
        self.metrics().inc_tool_calls();

        if let Some(handler) = entry.async_handler {
            let tasks = &self.inner.tasks;
            let task = tasks.create(params.task.as_ref().and_then(|t| t.ttl), None);
            self.metrics().inc_tasks();
            debug!("tool {} started task {}", params.name, task.task_id);

            let handle = TaskHandle::new(tasks.clone(), &task.task_id);
            return match handler.start(params.arguments, handle).await {
                Ok(Some(result)) => {
                    // A task cancelled while starting keeps its cancelled record.
                    let task = match tasks.complete(&task.task_id, Some(result.clone()), None) {
                        Ok(task) => task,
                        Err(e) => {
                            debug!("task {} not completed: {}", task.task_id, e);
                            tasks.get(&task.task_id)?
                        }
                    };
                    Ok(serde_json::to_value(ToolResult {
                        task: Some(task),
                        ..result
                    })?)
                }
                Ok(None) => Ok(json!({ "task": tasks.get(&task.task_id)? })),
                Err(e) => {
                    warn!("tool {} failed to start: {}", params.name, e);
                    let task = tasks
                        .fail(&task.task_id, e.to_string())
                        .or_else(|_| tasks.get(&task.task_id))?;
                    Ok(serde_json::to_value(ToolResult {
                        task: Some(task),
                        ..ToolResult::error(e.to_string())
                    })?)
                }
            };
        }

        let Some(handler) = entry.handler else {
            debug!("tool {} has no handler", params.name);
            return Ok(serde_json::to_value(ToolResult::default())?);
        };

        let progress = params
            .progress_token()
            .and_then(ProgressToken::from_value)
            .map(|token| self.progress_reporter(token, None));
        let ctx = ToolContext {
            request_id,
            progress,
            cancellation: cancel,
            server: self.clone(),
        };

        let result = match handler.call(params.arguments, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!("tool {} failed: {}", params.name, e);
                ToolResult::error(e.to_string())
            }
        };
        Ok(serde_json::to_value(result)?)
    }
}

#[async_trait]
impl SessionPeer for Server {
    fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    async fn on_request(&self, request: JsonRpcRequest) {
        let id = request.id.clone();

        if request.method == methods::INITIALIZE {
            let result = self.handle_initialize(request.params);
            self.reply(id, result).await;
            return;
        }
        if request.method != methods::PING && !self.inner.initialize_seen.load(Ordering::SeqCst) {
            self.reply(id, Err(Error::NotInitialized)).await;
            return;
        }

        let cancel = CancellationToken::new();
        self.inner.active.insert(id.clone(), cancel.clone());

        let server = self.clone();
        tokio::spawn(async move {
            let result = server.dispatch(request, cancel.clone()).await;
            server.inner.active.remove(&id);
            if cancel.is_cancelled() {
                debug!("request {} was cancelled; not answering", id);
                return;
            }
            server.reply(id, result).await;
        });
    }

    async fn on_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::NOTIFY_INITIALIZED => {
                if !self.inner.initialize_seen.load(Ordering::SeqCst) {
                    warn!("initialized notification before initialize");
                    return;
                }
                match self.inner.session.set_state(SessionState::Ready) {
                    Ok(()) => {
                        info!("MCP session ready");
                        let _ = self.inner.events_tx.send(ServerEvent::Ready);
                    }
                    Err(e) => warn!("cannot enter ready state: {}", e),
                }
            }
            methods::NOTIFY_CANCELLED => {
                let params: Option<CancelledParams> = notification
                    .params
                    .and_then(|p| serde_json::from_value(p).ok());
                if let Some(params) = params {
                    if let Some((_, token)) = self.inner.active.remove(&params.request_id) {
                        info!(
                            "Request {} cancelled: {}",
                            params.request_id,
                            params.reason.as_deref().unwrap_or("no reason given")
                        );
                        token.cancel();
                    }
                }
            }
            methods::NOTIFY_ROOTS_LIST_CHANGED => {
                let _ = self.inner.events_tx.send(ServerEvent::RootsListChanged);
            }
            other => debug!("ignoring notification {}", other),
        }
    }

    fn on_closed(&self, state: SessionState) {
        self.cancel_active();
        self.finish(state);
    }
}

/// Forward task status changes as `notifications/tasks/status` while the
/// session lives.
async fn forward_task_updates(
    session: Arc<Session>,
    mut updates: mpsc::UnboundedReceiver<crate::types::Task>,
) {
    let mut state = session.subscribe_state();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(task) = update else { break };
                if !session.is_ready() {
                    continue;
                }
                let params = match serde_json::to_value(&task) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("cannot encode task {}: {}", task.task_id, e);
                        continue;
                    }
                };
                if let Err(e) = session.notify(methods::NOTIFY_TASK_STATUS, Some(params)).await {
                    debug!("task status for {} not delivered: {}", task.task_id, e);
                }
            }
            changed = state.changed() => {
                if changed.is_err() || session.is_terminated() {
                    break;
                }
            }
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| Error::InvalidParams(e.to_string()))
}
