//! MCP client implementation.
//!
//! [`Client::connect`] runs the handshake; afterwards every request method
//! maps to one MCP call. Requests the server makes of the client are answered
//! automatically (`roots/list`, `ping`) or surfaced as a
//! [`ClientEvent::SamplingRequest`] the embedder answers with
//! [`Client::respond_sampling`] or [`Client::reject_sampling`].

use async_trait::async_trait;
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::progress::ProgressParams;
use crate::mcp::protocol::*;
use crate::mcp::session::{spawn_event_loop, Role, Session, SessionPeer, SessionState};
use crate::metrics::Metrics;
use crate::transport::{lock, Transport};
use crate::types::{
    CallToolParams, CompleteParams, CompleteResult, CompletionArgument, CompletionReference,
    CompletionResult, CreateMessageParams, CreateMessageResult, GetPromptParams,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListRootsResult,
    ListTasksResult, ListToolsResult, Prompt, PromptResult, ReadResourceResult, Resource,
    ResourceContents, ResourceTemplate, ResourceUriParams, Root, Task, TaskIdParams, Tool,
    ToolResult,
};
use crate::VERSION;

/// Client settings sent during the handshake.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Version proposed in `initialize`.
    pub protocol_version: String,
    /// Roots served to `roots/list` until [`Client::set_roots`] changes them.
    pub roots: Vec<Root>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("mcp-engine-client", VERSION),
            capabilities: ClientCapabilities {
                roots: Some(RootsCapability { list_changed: true }),
                sampling: Some(SamplingCapability {}),
                experimental: None,
            },
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            roots: Vec::new(),
        }
    }
}

/// Something the server told or asked the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Answer with [`Client::respond_sampling`] or [`Client::reject_sampling`].
    SamplingRequest {
        id: RequestId,
        params: CreateMessageParams,
    },
    ToolsListChanged,
    ResourcesListChanged,
    PromptsListChanged,
    ResourceUpdated { uri: String },
    LogMessage(LoggingMessageParams),
    Progress(ProgressParams),
    TaskStatus(Task),
    /// The session ended.
    Closed(SessionState),
}

struct Inner {
    config: ClientConfig,
    session: Arc<Session>,
    server: Mutex<Option<InitializeResult>>,
    roots: Mutex<Vec<Root>>,
    /// Sampling requests surfaced but not yet answered.
    sampling: DashSet<RequestId>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    /// Set once the embedder holds the event receiver.
    events_taken: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// MCP client bound to one transport.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self::with_metrics(transport, config, Metrics::new())
    }

    pub fn with_metrics(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let roots = config.roots.clone();
        Self {
            inner: Arc::new(Inner {
                config,
                session: Arc::new(Session::new(Role::Client, transport, metrics)),
                server: Mutex::new(None),
                roots: Mutex::new(roots),
                sampling: DashSet::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                events_taken: AtomicBool::new(false),
                event_loop: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Events from the server, handed out once.
    ///
    /// Sampling requests are only accepted while someone holds the receiver.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        let events = lock(&self.inner.events_rx).take();
        if events.is_some() {
            self.inner.events_taken.store(true, Ordering::SeqCst);
        }
        events
    }

    /// The server's `initialize` answer.
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.inner.server).clone()
    }

    pub fn roots(&self) -> Vec<Root> {
        lock(&self.inner.roots).clone()
    }

    // ===== Lifecycle =====

    /// Connect the transport and run the handshake.
    ///
    /// Resolves once `notifications/initialized` was written.
    pub async fn connect(&self) -> Result<InitializeResult> {
        let session = self.inner.session.clone();
        let transport = session.transport().clone();
        let events = transport
            .take_events()
            .ok_or_else(|| Error::Internal("client already connected".to_string()))?;

        session.set_state(SessionState::Connecting)?;
        session.metrics().session_opened();
        *lock(&self.inner.event_loop) = Some(spawn_event_loop(self.clone(), events));

        if let Err(e) = transport.connect().await {
            self.fail(&e);
            return Err(e);
        }
        session.set_state(SessionState::Initializing)?;

        let params = InitializeParams {
            protocol_version: self.inner.config.protocol_version.clone(),
            capabilities: self.inner.config.capabilities.clone(),
            client_info: self.inner.config.client_info.clone(),
        };
        let value = match session
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await
        {
            Ok(value) => value,
            Err(e) => return Err(self.abandon(e).await),
        };
        let result: InitializeResult = match serde_json::from_value(value) {
            Ok(result) => result,
            Err(e) => {
                warn!("Malformed initialize result: {}", e);
                return Err(self.abandon(e.into()).await);
            }
        };

        if !is_supported_version(&result.protocol_version) {
            let err = Error::ProtocolVersionMismatch {
                server: result.protocol_version,
                supported: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
            };
            warn!("{}", err);
            return Err(self.abandon(err).await);
        }

        info!(
            "Connected to {} v{} (protocol {})",
            result.server_info.name, result.server_info.version, result.protocol_version
        );
        *lock(&self.inner.server) = Some(result.clone());
        session.set_state(SessionState::Ready)?;
        if let Err(e) = session.notify(methods::NOTIFY_INITIALIZED, None).await {
            return Err(self.abandon(e).await);
        }
        Ok(result)
    }

    /// Fail a handshake in progress: move to `Error` and close the transport.
    async fn abandon(&self, error: Error) -> Error {
        self.fail(&error);
        let _ = self.inner.session.transport().disconnect().await;
        error
    }

    fn fail(&self, error: &Error) {
        self.inner
            .session
            .terminate(SessionState::Error, &error.to_string());
        self.finish(SessionState::Error);
    }

    fn finish(&self, state: SessionState) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.session.metrics().session_closed();
        let _ = self.inner.events_tx.send(ClientEvent::Closed(state));
    }

    /// Close the session and the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let session = &self.inner.session;
        if session.is_terminated() {
            return Ok(());
        }
        let _ = session.set_state(SessionState::Closing);
        let result = session.transport().disconnect().await;
        session.terminate(SessionState::Disconnected, "client disconnected");
        self.finish(SessionState::Disconnected);

        let handle = lock(&self.inner.event_loop).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        result
    }

    // ===== Requests =====

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        self.call_with_cancel(method, params, None).await
    }

    async fn call_with_cancel<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<T> {
        if !self.inner.session.is_ready() {
            return Err(Error::NotInitialized);
        }
        let value = self
            .inner
            .session
            .request_with_cancel(method, params, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn ping(&self) -> Result<()> {
        self.call::<Value>(methods::PING, None).await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result: ListToolsResult = self.call(methods::TOOLS_LIST, None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<ToolResult> {
        self.call_tool_with(CallToolParams::new(name, arguments), None)
            .await
    }

    /// Call a tool with full params (task options, progress token) and an
    /// optional cancellation token.
    pub async fn call_tool_with(
        &self,
        params: CallToolParams,
        cancel: Option<CancellationToken>,
    ) -> Result<ToolResult> {
        self.call_with_cancel(
            methods::TOOLS_CALL,
            Some(serde_json::to_value(params)?),
            cancel,
        )
        .await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        let result: ListResourcesResult = self.call(methods::RESOURCES_LIST, None).await?;
        Ok(result.resources)
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        let result: ListResourceTemplatesResult =
            self.call(methods::RESOURCES_TEMPLATES_LIST, None).await?;
        Ok(result.resource_templates)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let result: ReadResourceResult = self
            .call(methods::RESOURCES_READ, Some(uri_params(uri)?))
            .await?;
        Ok(result.contents)
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        self.call::<Value>(methods::RESOURCES_SUBSCRIBE, Some(uri_params(uri)?))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.call::<Value>(methods::RESOURCES_UNSUBSCRIBE, Some(uri_params(uri)?))
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let result: ListPromptsResult = self.call(methods::PROMPTS_LIST, None).await?;
        Ok(result.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<PromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.call(methods::PROMPTS_GET, Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: CompletionArgument,
    ) -> Result<CompletionResult> {
        let params = CompleteParams {
            reference,
            argument,
        };
        let result: CompleteResult = self
            .call(
                methods::COMPLETION_COMPLETE,
                Some(serde_json::to_value(params)?),
            )
            .await?;
        Ok(result.completion)
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> Result<()> {
        let params = serde_json::to_value(SetLevelParams { level })?;
        self.call::<Value>(methods::LOGGING_SET_LEVEL, Some(params))
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.call(methods::TASKS_GET, Some(task_params(task_id)?))
            .await
    }

    /// Result of a completed or failed task.
    pub async fn task_result(&self, task_id: &str) -> Result<ToolResult> {
        self.call(methods::TASKS_RESULT, Some(task_params(task_id)?))
            .await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        self.call(methods::TASKS_CANCEL, Some(task_params(task_id)?))
            .await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let result: ListTasksResult = self.call(methods::TASKS_LIST, None).await?;
        Ok(result.tasks)
    }

    // ===== Role reversal =====

    /// Answer a surfaced sampling request.
    pub async fn respond_sampling(&self, id: RequestId, result: CreateMessageResult) -> Result<()> {
        self.take_sampling(&id)?;
        self.inner
            .session
            .respond(id, Ok(serde_json::to_value(result)?))
            .await
    }

    /// Refuse a surfaced sampling request.
    pub async fn reject_sampling(&self, id: RequestId, error: Error) -> Result<()> {
        self.take_sampling(&id)?;
        self.inner.session.respond(id, Err(error)).await
    }

    fn take_sampling(&self, id: &RequestId) -> Result<()> {
        self.inner
            .sampling
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidParams(format!("no sampling request {} is waiting", id)))
    }

    /// Replace the roots; the server is told when the session is ready.
    pub async fn set_roots(&self, roots: Vec<Root>) -> Result<()> {
        *lock(&self.inner.roots) = roots;
        if self.inner.session.is_ready() {
            self.inner
                .session
                .notify(methods::NOTIFY_ROOTS_LIST_CHANGED, None)
                .await?;
        }
        Ok(())
    }

    fn emit(&self, event: ClientEvent) {
        if self.inner.events_tx.send(event).is_err() {
            debug!("client event dropped: receiver gone");
        }
    }
}

#[async_trait]
impl SessionPeer for Client {
    fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    async fn on_request(&self, request: JsonRpcRequest) {
        let id = request.id;
        let result = match request.method.as_str() {
            methods::PING => Ok(json!({})),
            methods::ROOTS_LIST => serde_json::to_value(ListRootsResult {
                roots: self.roots(),
            })
            .map_err(Error::from),
            methods::SAMPLING_CREATE_MESSAGE => {
                let params = request
                    .params
                    .unwrap_or(Value::Null);
                match serde_json::from_value::<CreateMessageParams>(params) {
                    Ok(_) if !self.inner.events_taken.load(Ordering::SeqCst) => {
                        Err(Error::Internal("no sampling consumer".to_string()))
                    }
                    Ok(params) => {
                        self.inner.sampling.insert(id.clone());
                        let event = ClientEvent::SamplingRequest {
                            id: id.clone(),
                            params,
                        };
                        if self.inner.events_tx.send(event).is_ok() {
                            return;
                        }
                        self.inner.sampling.remove(&id);
                        Err(Error::Internal("no sampling consumer".to_string()))
                    }
                    Err(e) => Err(Error::InvalidParams(e.to_string())),
                }
            }
            other => Err(Error::MethodNotFound(other.to_string())),
        };

        if let Err(e) = self.inner.session.respond(id.clone(), result).await {
            warn!("could not answer server request {}: {}", id, e);
        }
    }

    async fn on_notification(&self, notification: JsonRpcNotification) {
        let params = notification.params.unwrap_or(Value::Null);
        let event = match notification.method.as_str() {
            methods::NOTIFY_TOOLS_LIST_CHANGED => Some(ClientEvent::ToolsListChanged),
            methods::NOTIFY_RESOURCES_LIST_CHANGED => Some(ClientEvent::ResourcesListChanged),
            methods::NOTIFY_PROMPTS_LIST_CHANGED => Some(ClientEvent::PromptsListChanged),
            methods::NOTIFY_RESOURCE_UPDATED => serde_json::from_value::<ResourceUriParams>(params)
                .ok()
                .map(|p| ClientEvent::ResourceUpdated { uri: p.uri }),
            methods::NOTIFY_MESSAGE => serde_json::from_value(params)
                .ok()
                .map(ClientEvent::LogMessage),
            methods::NOTIFY_PROGRESS => serde_json::from_value(params)
                .ok()
                .map(ClientEvent::Progress),
            methods::NOTIFY_TASK_STATUS => serde_json::from_value(params)
                .ok()
                .map(ClientEvent::TaskStatus),
            methods::NOTIFY_CANCELLED => None,
            other => {
                debug!("ignoring notification {}", other);
                return;
            }
        };

        match event {
            Some(event) => self.emit(event),
            None if notification.method != methods::NOTIFY_CANCELLED => {
                warn!("malformed {} notification", notification.method)
            }
            None => {}
        }
    }

    fn on_closed(&self, state: SessionState) {
        self.finish(state);
    }
}

fn uri_params(uri: &str) -> Result<Value> {
    Ok(serde_json::to_value(ResourceUriParams {
        uri: uri.to_string(),
    })?)
}

fn task_params(task_id: &str) -> Result<Value> {
    Ok(serde_json::to_value(TaskIdParams {
        task_id: task_id.to_string(),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StdioTransport;
    use crate::types::{ContentBlock, Role as MessageRole};
    use std::time::Duration;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };

    struct RawServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawServer {
        async fn send(&mut self, value: Value) {
            let line = format!("{}\n", value);
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for client output")
                .unwrap()
                .expect("client closed the stream");
            serde_json::from_str(&line).unwrap()
        }

        /// Answer `initialize` with `version` and swallow `initialized`.
        async fn accept(&mut self, version: &str) -> Value {
            let init = self.next().await;
            assert_eq!(init["method"], methods::INITIALIZE);
            self.send(json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": version,
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": "raw", "version": "0.0.1"},
                    "instructions": "be nice"
                }
            }))
            .await;
            init
        }
    }

    fn client_pair() -> (Client, RawServer) {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client_end);
        let client = Client::new(
            Arc::new(StdioTransport::from_streams(read, write)),
            ClientConfig {
                roots: vec![Root::new("file:///work", None)],
                ..ClientConfig::default()
            },
        );
        let (read, writer) = tokio::io::split(server_end);
        (
            client,
            RawServer {
                lines: BufReader::new(read).lines(),
                writer,
            },
        )
    }

    async fn connected() -> (Client, RawServer) {
        let (client, mut server) = client_pair();
        let connect = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        server.accept("2025-06-18").await;
        let initialized = server.next().await;
        assert_eq!(initialized["method"], methods::NOTIFY_INITIALIZED);
        connect.await.unwrap().unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake() {
        let (client, mut server) = client_pair();
        let connect = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });

        let init = server.accept("2025-06-18").await;
        assert_eq!(init["id"], "c-1");
        assert_eq!(init["params"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert!(init["params"]["capabilities"]["sampling"].is_object());

        let initialized = server.next().await;
        assert_eq!(initialized["method"], methods::NOTIFY_INITIALIZED);

        let result = connect.await.unwrap().unwrap();
        assert_eq!(result.instructions.as_deref(), Some("be nice"));
        assert_eq!(client.state(), SessionState::Ready);
        assert_eq!(client.server_info().unwrap().server_info.name, "raw");
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_connect() {
        let (client, mut server) = client_pair();
        let connect = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        server.accept("1999-01-01").await;

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProtocolVersionMismatch { .. }));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_malformed_initialize_result_fails_connect() {
        let (client, mut server) = client_pair();
        let mut events = client.take_events().unwrap();
        let connect = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });

        let init = server.next().await;
        server
            .send(json!({"jsonrpc": "2.0", "id": init["id"], "result": {"bogus": true}}))
            .await;

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Json(_)), "{:?}", err);
        assert_eq!(client.state(), SessionState::Error);
        assert_ne!(
            client.session().transport().state(),
            crate::transport::TransportState::Connected
        );
        assert!(client.server_info().is_none());

        let closed = loop {
            match events.recv().await.unwrap() {
                ClientEvent::Closed(state) => break state,
                _ => continue,
            }
        };
        assert_eq!(closed, SessionState::Error);
    }

    #[tokio::test]
    async fn test_requests_need_ready_session() {
        let (client, _server) = client_pair();
        assert!(matches!(client.list_tools().await, Err(Error::NotInitialized)));
        assert!(matches!(client.ping().await, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let (_client, mut server) = connected().await;

        server
            .send(json!({"jsonrpc": "2.0", "id": "s-1", "method": "roots/list"}))
            .await;
        let roots = server.next().await;
        assert_eq!(roots["id"], "s-1");
        assert_eq!(roots["result"]["roots"][0]["uri"], "file:///work");

        server
            .send(json!({"jsonrpc": "2.0", "id": "s-2", "method": "ping"}))
            .await;
        assert_eq!(server.next().await["result"], json!({}));

        server
            .send(json!({"jsonrpc": "2.0", "id": "s-3", "method": "elicitation/create"}))
            .await;
        assert_eq!(server.next().await["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_sampling_round_trip() {
        let (client, mut server) = connected().await;
        let mut events = client.take_events().unwrap();

        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": "s-7",
                "method": "sampling/createMessage",
                "params": {
                    "messages": [{"role": "user", "content": {"type": "text", "text": "2+2?"}}],
                    "maxTokens": 10
                }
            }))
            .await;

        let (id, params) = loop {
            match events.recv().await.unwrap() {
                ClientEvent::SamplingRequest { id, params } => break (id, params),
                _ => continue,
            }
        };
        assert_eq!(id, RequestId::from("s-7"));
        assert_eq!(params.max_tokens, Some(10));

        client
            .respond_sampling(
                id.clone(),
                CreateMessageResult {
                    role: MessageRole::Assistant,
                    content: ContentBlock::text("4"),
                    model: "test-model".to_string(),
                    stop_reason: None,
                },
            )
            .await
            .unwrap();
        let answer = server.next().await;
        assert_eq!(answer["id"], "s-7");
        assert_eq!(answer["result"]["model"], "test-model");

        // Answered once only.
        assert!(client.reject_sampling(id, Error::Internal("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_sampling_without_consumer_is_rejected() {
        let (_client, mut server) = connected().await;

        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": "s-1",
                "method": "sampling/createMessage",
                "params": {
                    "messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}],
                    "maxTokens": 5
                }
            }))
            .await;

        let answer = server.next().await;
        assert_eq!(answer["id"], "s-1");
        assert_eq!(answer["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_notifications_become_events() {
        let (client, mut server) = connected().await;
        let mut events = client.take_events().unwrap();

        server
            .send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))
            .await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/resources/updated",
                "params": {"uri": "file:///a.txt"}
            }))
            .await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": "hello"}
            }))
            .await;

        assert_eq!(events.recv().await.unwrap(), ClientEvent::ToolsListChanged);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::ResourceUpdated {
                uri: "file:///a.txt".to_string()
            }
        );
        match events.recv().await.unwrap() {
            ClientEvent::LogMessage(message) => {
                assert_eq!(message.level, LoggingLevel::Info);
                assert_eq!(message.data, json!("hello"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_call_notifies_server() {
        let (client, mut server) = connected().await;
        let cancel = CancellationToken::new();

        let call = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                client
                    .call_tool_with(CallToolParams::new("slow", Map::new()), Some(cancel))
                    .await
            }
        });

        let request = server.next().await;
        assert_eq!(request["method"], methods::TOOLS_CALL);
        cancel.cancel();

        let notice = server.next().await;
        assert_eq!(notice["method"], methods::NOTIFY_CANCELLED);
        assert_eq!(notice["params"]["requestId"], request["id"]);
        assert!(matches!(call.await.unwrap(), Err(Error::Cancelled(_))));
        assert!(client.session().pending().is_empty());
    }

    #[tokio::test]
    async fn test_set_roots_announces_change() {
        let (client, mut server) = connected().await;
        client
            .set_roots(vec![Root::new("file:///other", Some("other".into()))])
            .await
            .unwrap();
        let notice = server.next().await;
        assert_eq!(notice["method"], methods::NOTIFY_ROOTS_LIST_CHANGED);
        assert_eq!(client.roots()[0].uri, "file:///other");
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending() {
        let (client, mut server) = connected().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.list_tools().await }
        });
        server.next().await;

        client.disconnect().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_connection_closed());
        assert_eq!(client.state(), SessionState::Disconnected);
    }
}
