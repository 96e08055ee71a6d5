//! HTTP+SSE server transport.
//!
//! One MCP session per transport instance. Clients POST envelopes to the POST
//! path; the server answers requests inline when the handler finishes within
//! the inline window, otherwise with `202 Accepted` followed by an SSE
//! `message` event on the SSE path. Only one SSE client may be attached.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::http_client::SESSION_HEADER;
use super::{lock, EventReceiver, Transport, TransportCore, TransportState};
use crate::error::{Error, Result};
use crate::mcp::codec::{self, Message};
use crate::mcp::protocol::RequestId;
use crate::metrics::{Metrics, PROMETHEUS_CONTENT_TYPE};

/// Frames kept for delivery while no SSE client is attached.
const MAX_BACKLOG: usize = 1024;

/// HTTP+SSE server configuration.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Listen address; port 0 picks a free port.
    pub bind: SocketAddr,
    pub post_path: String,
    pub sse_path: String,
    /// Required `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    /// How long a POSTed request waits for an inline answer before `202`.
    pub inline_response_timeout: Duration,
    /// SSE comment keepalive interval.
    pub sse_keepalive: Option<Duration>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            post_path: "/".to_string(),
            sse_path: "/sse".to_string(),
            bearer_token: None,
            inline_response_timeout: Duration::from_secs(10),
            sse_keepalive: Some(Duration::from_secs(15)),
        }
    }
}

struct Attachment {
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
}

struct Shared {
    core: Arc<TransportCore>,
    metrics: Arc<Metrics>,
    config: HttpServerConfig,
    session_id: Mutex<Option<String>>,
    terminated: AtomicBool,
    sse: Mutex<Option<Attachment>>,
    backlog: Mutex<VecDeque<String>>,
    inline: DashMap<RequestId, oneshot::Sender<String>>,
    next_attachment: AtomicU64,
    shutdown: CancellationToken,
}

fn message_event(frame: &str) -> Event {
    Event::default().event("message").data(frame)
}

impl Shared {
    fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.config.bearer_token {
            None => true,
            Some(token) => headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|presented| presented == token)
                .unwrap_or(false),
        }
    }

    /// Resolve the session for an incoming request, assigning one if none exists yet.
    fn resolve_session(&self, presented: Option<&str>) -> std::result::Result<String, Response> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(status_response(StatusCode::NOT_FOUND, "session terminated"));
        }
        let mut slot = lock(&self.session_id);
        match (slot.as_deref(), presented) {
            (Some(current), Some(presented)) if current == presented => Ok(current.to_string()),
            (Some(_), Some(_)) => Err(status_response(StatusCode::NOT_FOUND, "unknown session")),
            (Some(_), None) => Err(status_response(
                StatusCode::BAD_REQUEST,
                "missing Mcp-Session-Id",
            )),
            (None, Some(_)) => Err(status_response(StatusCode::NOT_FOUND, "unknown session")),
            (None, None) => {
                let id = Uuid::new_v4().to_string();
                info!("HTTP session assigned: {}", id);
                *slot = Some(id.clone());
                Ok(id)
            }
        }
    }

    /// Deliver a frame over SSE, or keep it until a client attaches.
    fn deliver(&self, frame: String) {
        let mut sse = lock(&self.sse);
        if let Some(attachment) = sse.as_ref() {
            if attachment.tx.send(message_event(&frame)).is_ok() {
                return;
            }
            debug!("SSE client gone; buffering");
            *sse = None;
        }
        let mut backlog = lock(&self.backlog);
        if backlog.len() >= MAX_BACKLOG {
            warn!("SSE backlog full; dropping oldest frame");
            backlog.pop_front();
        }
        backlog.push_back(frame);
    }

    fn attach(self: &Arc<Self>, session_id: &str) -> std::result::Result<SseStream, Response> {
        let mut sse = lock(&self.sse);
        if sse.is_some() {
            return Err(status_response(
                StatusCode::CONFLICT,
                "an SSE client is already attached",
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_attachment.fetch_add(1, Ordering::SeqCst);
        let endpoint = format!("{}?sessionId={}", self.config.post_path, session_id);
        let _ = tx.send(Event::default().event("endpoint").data(endpoint));
        for frame in lock(&self.backlog).drain(..) {
            let _ = tx.send(message_event(&frame));
        }
        *sse = Some(Attachment { id, tx });
        info!("SSE client attached to session {}", session_id);

        Ok(SseStream {
            inner: UnboundedReceiverStream::new(rx),
            _guard: AttachmentGuard {
                shared: self.clone(),
                id,
            },
        })
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        lock(&self.session_id).take();
        lock(&self.sse).take();
        lock(&self.backlog).clear();
        self.inline.clear();
    }
}

/// Clears the attachment slot when the SSE response is dropped.
struct AttachmentGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for AttachmentGuard {
    fn drop(&mut self) {
        let mut sse = lock(&self.shared.sse);
        if matches!(sse.as_ref(), Some(a) if a.id == self.id) {
            debug!("SSE client detached");
            *sse = None;
        }
    }
}

struct SseStream {
    inner: UnboundedReceiverStream<Event>,
    _guard: AttachmentGuard,
}

impl Stream for SseStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(Ok))
    }
}

fn status_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn with_session(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

fn presented_session<'a>(headers: &'a HeaderMap, query: &'a HashMap<String, String>) -> Option<&'a str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get("sessionId").map(String::as_str))
}

fn json_frame(status: StatusCode, frame: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        frame,
    )
        .into_response()
}

/// POST handler: one envelope per request body.
async fn handle_post(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !shared.authorized(&headers) {
        return status_response(StatusCode::UNAUTHORIZED, "invalid bearer token");
    }
    let session_id = match shared.resolve_session(presented_session(&headers, &query)) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let text = String::from_utf8_lossy(&body);
    let message = match codec::decode_line(&text) {
        Ok(message) => message,
        Err(e) => {
            warn!("rejecting POST body: {}", e);
            let reply = Message::error(None, e.to_jsonrpc());
            return with_session(
                json_frame(StatusCode::BAD_REQUEST, codec::encode_line(&reply)),
                &session_id,
            );
        }
    };

    let id = match &message {
        Message::Request(req) => req.id.clone(),
        _ => {
            shared.core.emit_message(message);
            return with_session(StatusCode::ACCEPTED.into_response(), &session_id);
        }
    };

    let (tx, rx) = oneshot::channel();
    shared.inline.insert(id.clone(), tx);
    shared.core.emit_message(message);

    match tokio::time::timeout(shared.config.inline_response_timeout, rx).await {
        Ok(Ok(frame)) => with_session(json_frame(StatusCode::OK, frame), &session_id),
        _ => {
            shared.inline.remove(&id);
            debug!("request {} answered asynchronously", id);
            with_session(StatusCode::ACCEPTED.into_response(), &session_id)
        }
    }
}

/// SSE handler: attach the single event-stream client.
async fn handle_sse(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !shared.authorized(&headers) {
        return status_response(StatusCode::UNAUTHORIZED, "invalid bearer token");
    }
    if lock(&shared.sse).is_some() {
        return status_response(StatusCode::CONFLICT, "an SSE client is already attached");
    }

    let presented = presented_session(&headers, &query);
    let session_id = match (shared.session_id(), presented) {
        // Streamable clients may open the stream without echoing the id.
        (Some(current), None) if !shared.terminated.load(Ordering::SeqCst) => current,
        _ => match shared.resolve_session(presented) {
            Ok(id) => id,
            Err(response) => return response,
        },
    };

    let stream = match shared.attach(&session_id) {
        Ok(stream) => stream,
        Err(response) => return response,
    };
    let response = match shared.config.sse_keepalive {
        Some(interval) => Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(interval))
            .into_response(),
        None => Sse::new(stream).into_response(),
    };
    with_session(response, &session_id)
}

/// DELETE handler: terminate the session.
async fn handle_delete(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !shared.authorized(&headers) {
        return status_response(StatusCode::UNAUTHORIZED, "invalid bearer token");
    }
    let presented = presented_session(&headers, &query);
    if presented.is_none() || shared.session_id().as_deref() != presented {
        return status_response(StatusCode::NOT_FOUND, "unknown session");
    }

    info!("HTTP session terminated by client");
    shared.terminate();
    shared.core.set_state(TransportState::Disconnected);
    shared.shutdown.cancel();
    StatusCode::OK.into_response()
}

/// Prometheus scrape endpoint.
async fn metrics_export(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        shared.metrics.to_prometheus(),
    )
}

/// Health check endpoint.
async fn health_check(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "state": shared.core.state().to_string(),
        "session": shared.session_id(),
    }))
}

/// HTTP+SSE server transport.
pub struct HttpServerTransport {
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServerTransport {
    pub fn new(config: HttpServerConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    /// Serve `metrics` on `/metrics`; pass the collector the session reports into.
    pub fn with_metrics(config: HttpServerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Arc::new(TransportCore::new("http-server")),
                metrics,
                config,
                session_id: Mutex::new(None),
                terminated: AtomicBool::new(false),
                sse: Mutex::new(None),
                backlog: Mutex::new(VecDeque::new()),
                inline: DashMap::new(),
                next_attachment: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
            local_addr: Mutex::new(None),
        }
    }

    /// Address actually bound, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    /// The axum router serving this transport.
    pub fn router(&self) -> Router {
        let config = &self.shared.config;
        let routes = if config.post_path == config.sse_path {
            Router::new().route(
                &config.post_path,
                post(handle_post).get(handle_sse).delete(handle_delete),
            )
        } else {
            Router::new()
                .route(&config.post_path, post(handle_post).delete(handle_delete))
                .route(&config.sse_path, get(handle_sse))
        };

        routes
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_export))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers([HeaderName::from_static(SESSION_HEADER)]),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone())
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    fn kind(&self) -> &'static str {
        self.shared.core.kind()
    }

    fn state(&self) -> TransportState {
        self.shared.core.state()
    }

    fn take_events(&self) -> Option<EventReceiver> {
        self.shared.core.take_events()
    }

    async fn connect(&self) -> Result<()> {
        let core = &self.shared.core;
        core.transition(&[TransportState::Disconnected], TransportState::Connecting)?;

        let listener = match TcpListener::bind(self.shared.config.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                core.set_state(TransportState::Error);
                return Err(Error::HttpServer(format!(
                    "failed to bind {}: {}",
                    self.shared.config.bind, e
                )));
            }
        };
        let addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(addr);
        info!("MCP HTTP server listening on {}", addr);

        let router = self.router();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("HTTP server stopped: {}", e);
            }
        });

        core.set_state(TransportState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let core = &self.shared.core;
        if core.state() == TransportState::Disconnected {
            return Ok(());
        }
        core.set_state(TransportState::Disconnecting);
        self.shared.terminate();
        self.shared.shutdown.cancel();
        core.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.shared.core.ensure_connected()?;
        let mut frame = codec::encode_line(&message);

        let reply_to = match &message {
            Message::Response(res) => Some(&res.id),
            Message::Error(err) => err.id.as_ref(),
            _ => None,
        };
        if let Some(id) = reply_to {
            if let Some((_, waiter)) = self.shared.inline.remove(id) {
                match waiter.send(frame) {
                    Ok(()) => return Ok(()),
                    // The POST already returned 202.
                    Err(returned) => frame = returned,
                }
            }
        }

        self.shared.deliver(frame);
        Ok(())
    }
}
