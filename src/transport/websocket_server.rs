//! WebSocket server transport.
//!
//! Serves a single client at a time on the configured path. The transport is
//! `Connecting` while it waits for the upgrade, `Connected` while a client is
//! attached, and `Disconnected` once that client goes away.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

use super::{
    fail_queued, lock, ChannelSink, EventReceiver, Outbound, Transport, TransportCore,
    TransportState, WriteQueue,
};
use crate::error::{Error, Result};
use crate::mcp::codec::{self, Message};
use crate::metrics::{Metrics, PROMETHEUS_CONTENT_TYPE};

/// WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct WebSocketServerConfig {
    pub bind: SocketAddr,
    pub path: String,
    /// Offered subprotocols; the first one the client also lists is selected.
    pub subprotocols: Vec<String>,
    /// Reject upgrades whose `Origin` header differs.
    pub required_origin: Option<String>,
    pub bearer_token: Option<String>,
    pub keepalive_interval: Option<Duration>,
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
            path: "/".to_string(),
            subprotocols: Vec::new(),
            required_origin: None,
            bearer_token: None,
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

struct Attached {
    id: u64,
    writer: WriteQueue,
}

struct Shared {
    core: Arc<TransportCore>,
    metrics: Arc<Metrics>,
    config: WebSocketServerConfig,
    client: Mutex<Option<Attached>>,
    next_client: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn release(&self, id: u64) {
        let mut client = lock(&self.client);
        if matches!(client.as_ref(), Some(c) if c.id == id) {
            *client = None;
        }
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn handle_upgrade(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let config = &shared.config;

    if let Some(token) = &config.bearer_token {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(token.as_str()) {
            return reject(StatusCode::UNAUTHORIZED, "invalid bearer token");
        }
    }
    if let Some(required) = &config.required_origin {
        let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
        if origin != Some(required.as_str()) {
            warn!("WebSocket upgrade rejected: origin {:?}", origin);
            return reject(StatusCode::FORBIDDEN, "origin not allowed");
        }
    }

    let (id, outbound) = {
        let mut client = lock(&shared.client);
        if client.is_some() {
            return reject(StatusCode::CONFLICT, "a client is already connected");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (writer, _writer_task) = WriteQueue::spawn(ChannelSink::new(tx));
        let id = shared.next_client.fetch_add(1, Ordering::SeqCst);
        *client = Some(Attached { id, writer });
        (id, rx)
    };

    let ws = if config.subprotocols.is_empty() {
        ws
    } else {
        ws.protocols(config.subprotocols.clone())
    };

    let on_failure = shared.clone();
    ws.on_failed_upgrade(move |e| {
        warn!("WebSocket upgrade failed: {}", e);
        on_failure.release(id);
    })
    .on_upgrade(move |socket| serve_socket(shared, socket, outbound, id))
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn serve_socket(
    shared: Arc<Shared>,
    socket: WebSocket,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    id: u64,
) {
    let core = &shared.core;
    info!("WebSocket client attached");
    core.set_state(TransportState::Connected);

    let (mut sink, mut source) = socket.split();
    let mut ticker = shared
        .config
        .keepalive_interval
        .map(|every| tokio::time::interval_at(Instant::now() + every, every));

    let lost: Option<String> = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break None;
            }
            job = outbound.recv() => match job {
                Some(job) => {
                    trace!("websocket send: {}", job.frame);
                    let result = sink
                        .send(WsMessage::Text(job.frame.into()))
                        .await
                        .map_err(|e| Error::WebSocket(e.to_string()));
                    let failed = result.as_ref().err().map(|e| e.to_string());
                    let _ = job.done.send(result);
                    if let Some(reason) = failed {
                        break Some(reason);
                    }
                }
                None => break None,
            },
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => core.emit_frame(text.as_str()),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => core.emit_frame(text),
                    Err(_) => warn!("websocket: ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(_))) => break Some("closed by client".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break Some("stream ended".to_string()),
            },
            _ = tick(&mut ticker) => {
                if let Err(e) = sink.send(WsMessage::Ping(Bytes::new())).await {
                    break Some(format!("keepalive failed: {}", e));
                }
            }
        }
    };

    shared.release(id);
    fail_queued(&mut outbound);

    if let Some(reason) = lost {
        info!("WebSocket client detached: {}", reason);
        if reason != "closed by client" {
            core.emit_error(Error::ConnectionClosed(reason));
        }
        core.set_state(TransportState::Disconnected);
        shared.shutdown.cancel();
    }
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
    }))
}

/// WebSocket server transport.
pub struct WebSocketServerTransport {
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WebSocketServerTransport {
    pub fn new(config: WebSocketServerConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    /// Serve `metrics` on `/metrics`; pass the collector the session reports into.
    pub fn with_metrics(config: WebSocketServerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Arc::new(TransportCore::new("websocket-server")),
                metrics,
                config,
                client: Mutex::new(None),
                next_client: AtomicU64::new(1),
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

    pub fn router(&self) -> Router {
        let mut router = Router::new().route(&self.shared.config.path, get(handle_upgrade));
        if self.shared.config.path != "/health" {
            router = router.route("/health", get(health_check));
        }
        if self.shared.config.path != "/metrics" {
            router = router.route("/metrics", get(metrics_export));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone())
    }
}

#[async_trait]
impl Transport for WebSocketServerTransport {
    fn kind(&self) -> &'static str {
        self.shared.core.kind()
    }

    fn state(&self) -> TransportState {
        self.shared.core.state()
    }

    fn take_events(&self) -> Option<EventReceiver> {
        self.shared.core.take_events()
    }

    /// Start listening; the transport stays `Connecting` until a client attaches.
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
        info!(
            "MCP WebSocket server listening on ws://{}{}",
            addr, self.shared.config.path
        );

        let router = self.router();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("WebSocket server stopped: {}", e);
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let core = &self.shared.core;
        if core.state() == TransportState::Disconnected {
            return Ok(());
        }
        core.set_state(TransportState::Disconnecting);
        self.shared.shutdown.cancel();
        lock(&self.shared.client).take();
        debug!("WebSocket server shut down");
        core.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.shared.core.ensure_connected()?;
        let writer = lock(&self.shared.client)
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or_else(|| Error::ConnectionClosed("no WebSocket client attached".to_string()))?;
        writer.write(codec::encode_line(&message)).await
    }
}
