//! WebSocket client transport.
//!
//! One JSON value per text frame. A single connection task owns the socket:
//! it writes queued frames, forwards inbound frames, sends keepalive pings and
//! reconnects with exponential backoff when the connection drops.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::{Backoff, BackoffParams};
use super::{
    fail_queued, lock, ChannelSink, EventReceiver, Outbound, Transport, TransportCore,
    TransportState, WriteQueue,
};
use crate::error::{Error, Result};
use crate::mcp::codec::{self, Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WebSocketClientConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    pub bearer_token: Option<String>,
    pub origin: Option<String>,
    pub subprotocols: Vec<String>,
    /// Send an empty ping this often while connected.
    pub keepalive_interval: Option<Duration>,
    /// Reconnect after an unplanned close or a failed handshake.
    pub reconnect: bool,
    /// First reconnect delay; doubles per attempt up to 30s.
    pub reconnect_initial_delay: Duration,
    /// Consecutive failed handshakes tolerated before giving up.
    pub max_reconnect_attempts: Option<u32>,
}

impl WebSocketClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for WebSocketClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/".to_string(),
            bearer_token: None,
            origin: None,
            subprotocols: Vec::new(),
            keepalive_interval: None,
            reconnect: false,
            reconnect_initial_delay: Duration::from_secs(1),
            max_reconnect_attempts: None,
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::WebSocket(e.to_string())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("invalid header value {:?}: {}", value, e)))
}

async fn handshake(config: &WebSocketClientConfig) -> Result<WsStream> {
    let mut request = config.url.as_str().into_client_request().map_err(ws_error)?;
    let headers = request.headers_mut();
    if let Some(token) = &config.bearer_token {
        headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
    }
    if let Some(origin) = &config.origin {
        headers.insert(header::ORIGIN, header_value(origin)?);
    }
    if !config.subprotocols.is_empty() {
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header_value(&config.subprotocols.join(", "))?,
        );
    }

    let (stream, response) = connect_async(request).await.map_err(ws_error)?;
    debug!("WebSocket handshake with {} -> {}", config.url, response.status());
    Ok(stream)
}

enum PumpEnd {
    Shutdown,
    Closed(String),
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn pump(
    core: &TransportCore,
    config: &WebSocketClientConfig,
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    shutdown: &CancellationToken,
) -> PumpEnd {
    let (mut sink, mut source) = stream.split();
    let mut ticker = config
        .keepalive_interval
        .map(|every| tokio::time::interval_at(Instant::now() + every, every));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = sink.close().await;
                return PumpEnd::Shutdown;
            }
            job = outbound.recv() => match job {
                Some(job) => {
                    trace!("websocket send: {}", job.frame);
                    let result = sink.send(WsMessage::text(job.frame)).await.map_err(ws_error);
                    let failed = result.as_ref().err().map(|e| e.to_string());
                    let _ = job.done.send(result);
                    if let Some(reason) = failed {
                        return PumpEnd::Closed(reason);
                    }
                }
                None => return PumpEnd::Shutdown,
            },
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => core.emit_frame(text.as_str()),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => core.emit_frame(text),
                    Err(_) => warn!("websocket: ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| {
                            format!("closed by peer ({}): {}", u16::from(f.code), f.reason.as_str())
                        })
                        .unwrap_or_else(|| "closed by peer".to_string());
                    return PumpEnd::Closed(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpEnd::Closed(e.to_string()),
                None => return PumpEnd::Closed("stream ended".to_string()),
            },
            _ = tick(&mut ticker) => {
                if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
                    return PumpEnd::Closed(format!("keepalive failed: {}", e));
                }
            }
        }
    }
}

async fn run(
    core: Arc<TransportCore>,
    config: WebSocketClientConfig,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::new(BackoffParams::reconnect(
        config.reconnect_initial_delay,
        config.max_reconnect_attempts,
    ));
    let mut failures = 0u32;

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        core.set_state(TransportState::Connecting);

        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = handshake(&config) => result,
        };

        match attempt {
            Ok(stream) => {
                failures = 0;
                backoff.reset();
                info!("WebSocket connected to {}", config.url);
                core.set_state(TransportState::Connected);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }

                match pump(&core, &config, stream, &mut outbound, &shutdown).await {
                    PumpEnd::Shutdown => break,
                    PumpEnd::Closed(reason) => {
                        warn!("WebSocket connection lost: {}", reason);
                        fail_queued(&mut outbound);
                        core.emit_error(Error::ConnectionClosed(reason));
                        if !config.reconnect {
                            core.set_state(TransportState::Disconnected);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!("WebSocket handshake {} failed: {}", failures, e);
                if !config.reconnect {
                    core.set_state(TransportState::Error);
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(e));
                        }
                        None => core.emit_error(e),
                    }
                    return;
                }
                core.emit_error(e);
            }
        }

        if let Some(max) = backoff.max_tries() {
            if failures >= max {
                let exceeded =
                    || Error::Transport(format!("reconnect attempts exceeded ({})", max));
                warn!("WebSocket giving up after {} attempts", failures);
                core.set_state(TransportState::Error);
                core.emit_error(exceeded());
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(exceeded()));
                }
                fail_queued(&mut outbound);
                return;
            }
        }

        let delay = backoff.next_delay();
        info!(
            "WebSocket reconnecting to {} in {} ms",
            config.url,
            delay.as_millis()
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(Error::ConnectionClosed(
            "disconnected before the connection was established".to_string(),
        )));
    }
}

/// WebSocket client transport.
pub struct WebSocketClientTransport {
    core: Arc<TransportCore>,
    config: WebSocketClientConfig,
    writer: Mutex<Option<WriteQueue>>,
    shutdown: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketClientTransport {
    pub fn new(config: WebSocketClientConfig) -> Self {
        Self {
            core: Arc::new(TransportCore::new("websocket-client")),
            config,
            writer: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WebSocketClientConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for WebSocketClientTransport {
    fn kind(&self) -> &'static str {
        self.core.kind()
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn take_events(&self) -> Option<EventReceiver> {
        self.core.take_events()
    }

    /// Resolves after the first successful handshake, or with the error that
    /// ended the connection attempts.
    async fn connect(&self) -> Result<()> {
        self.core.transition(
            &[TransportState::Disconnected, TransportState::Error],
            TransportState::Connecting,
        )?;

        let shutdown = CancellationToken::new();
        *lock(&self.shutdown) = shutdown.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (queue, _writer_task) = WriteQueue::spawn(ChannelSink::new(tx));
        *lock(&self.writer) = Some(queue);

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            self.core.clone(),
            self.config.clone(),
            rx,
            shutdown,
            ready_tx,
        ));
        *lock(&self.task) = Some(task);

        ready_rx.await.map_err(|_| {
            Error::ConnectionClosed("websocket connection task ended".to_string())
        })?
    }

    async fn disconnect(&self) -> Result<()> {
        if self.core.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.core.set_state(TransportState::Disconnecting);
        lock(&self.shutdown).cancel();
        lock(&self.writer).take();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("websocket connection task ended abnormally: {}", e);
            }
        }
        self.core.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.core.ensure_connected()?;
        let queue = lock(&self.writer)
            .clone()
            .ok_or_else(|| Error::ConnectionClosed("websocket writer closed".to_string()))?;
        queue.write(codec::encode_line(&message)).await
    }
}
