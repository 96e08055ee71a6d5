//! Transport layer implementations.
//!
//! A transport moves [`Message`] envelopes between two peers and reports what
//! happens on the wire through a single event stream:
//!
//! - `stdio` - NDJSON over process pipes, a subprocess, or any reader/writer pair
//! - `http_client` / `http_server` - POST out, SSE in
//! - `websocket_client` / `websocket_server` - one JSON value per text frame
//! - `unix` - Unix-domain listener spawning one stdio-style session per connection
//!
//! Every transport funnels outbound frames through a [`WriteQueue`], so writes
//! on one connection never interleave and complete in the order they were
//! issued.

pub mod backoff;
pub mod http_client;
pub mod http_server;
pub mod sse;
pub mod stdio;
#[cfg(unix)]
pub mod unix;
pub mod websocket_client;
pub mod websocket_server;

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::codec::{self, Message};

pub use http_client::{HttpClientConfig, HttpClientTransport};
pub use http_server::{HttpServerConfig, HttpServerTransport};
pub use stdio::StdioTransport;
#[cfg(unix)]
pub use unix::{ListenerEvent, UnixListenerConfig, UnixSessionListener};
pub use websocket_client::{WebSocketClientConfig, WebSocketClientTransport};
pub use websocket_server::{WebSocketServerConfig, WebSocketServerTransport};

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Something that happened on a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded envelope arrived.
    Message(Message),
    /// The transport moved between states.
    StateChanged {
        old: TransportState,
        new: TransportState,
    },
    /// A non-fatal or fatal error; fatal ones are followed by a state change.
    Error(Error),
}

/// Receiving end of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Hand out the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<EventReceiver>;

    /// Establish the connection (or start listening, for server transports).
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Write one envelope; resolves once this envelope's own write finished.
    async fn send(&self, message: Message) -> Result<()>;
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State and event plumbing shared by every transport implementation.
pub struct TransportCore {
    kind: &'static str,
    state: Mutex<TransportState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<EventReceiver>>,
}

impl TransportCore {
    pub fn new(kind: &'static str) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            kind,
            state: Mutex::new(TransportState::Disconnected),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Move to `new`, emitting `StateChanged` if the state actually changed.
    /// Returns the previous state.
    pub fn set_state(&self, new: TransportState) -> TransportState {
        let old = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            debug!("{} transport: {} -> {}", self.kind, old, new);
            let _ = self
                .events_tx
                .send(TransportEvent::StateChanged { old, new });
        }
        old
    }

    /// Move to `new` only when the current state is one of `from`.
    pub fn transition(&self, from: &[TransportState], new: TransportState) -> Result<()> {
        let old = {
            let mut state = lock(&self.state);
            if !from.contains(&*state) {
                return Err(Error::Transport(format!(
                    "{} transport cannot go from {} to {}",
                    self.kind, *state, new
                )));
            }
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            debug!("{} transport: {} -> {}", self.kind, old, new);
            let _ = self
                .events_tx
                .send(TransportEvent::StateChanged { old, new });
        }
        Ok(())
    }

    pub fn take_events(&self) -> Option<EventReceiver> {
        lock(&self.events_rx).take()
    }

    pub fn emit_message(&self, message: Message) {
        let _ = self.events_tx.send(TransportEvent::Message(message));
    }

    pub fn emit_error(&self, error: Error) {
        let _ = self.events_tx.send(TransportEvent::Error(error));
    }

    /// Decode one text frame and emit it; malformed frames become error events.
    pub fn emit_frame(&self, frame: &str) {
        if frame.trim().is_empty() {
            return;
        }
        trace!("{} recv: {}", self.kind, frame);
        match codec::decode_line(frame) {
            Ok(message) => self.emit_message(message),
            Err(e) => {
                warn!("{} transport: dropping malformed frame: {}", self.kind, e);
                self.emit_error(e);
            }
        }
    }

    /// Fail fast when the transport cannot carry a write.
    pub fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            TransportState::Connected => Ok(()),
            other => Err(Error::ConnectionClosed(format!(
                "{} transport is {}",
                self.kind, other
            ))),
        }
    }
}

/// Destination of serialized outbound frames.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete frame.
    async fn write_frame(&mut self, frame: String) -> Result<()>;

    /// Flush and release the underlying stream.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether a failed write leaves the sink unusable.
    fn stops_on_error(&self) -> bool {
        true
    }
}

struct WriteJob {
    frame: String,
    done: oneshot::Sender<Result<()>>,
}

/// Ordered, one-at-a-time writer in front of a [`FrameSink`].
///
/// Dropping every clone closes the sink after the queued frames are written.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriteQueue {
    /// Start the writer task for `sink`.
    pub fn spawn<S: FrameSink>(mut sink: S) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = sink.write_frame(job.frame).await;
                let fatal = result.is_err() && sink.stops_on_error();
                if let Err(e) = &result {
                    debug!("frame write failed: {}", e);
                }
                let _ = job.done.send(result);
                if fatal {
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!("closing frame sink failed: {}", e);
            }
        });
        (Self { tx }, handle)
    }

    /// Queue `frame` and wait for its write to finish.
    pub async fn write(&self, frame: String) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriteJob { frame, done })
            .map_err(|_| Error::ConnectionClosed("write queue closed".to_string()))?;
        rx.await
            .map_err(|_| Error::ConnectionClosed("writer stopped".to_string()))?
    }
}

/// A frame handed to a connection task that owns the socket.
pub(crate) struct Outbound {
    pub frame: String,
    pub done: oneshot::Sender<Result<()>>,
}

/// Forwards frames to a connection task and waits for the socket write.
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write_frame(&mut self, frame: String) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Outbound { frame, done })
            .map_err(|_| Error::ConnectionClosed("connection task ended".to_string()))?;
        rx.await
            .map_err(|_| Error::ConnectionClosed("connection task ended".to_string()))?
    }

    // The socket behind the channel may be replaced; keep the queue alive.
    fn stops_on_error(&self) -> bool {
        false
    }
}

/// Fail every frame still waiting for a socket that is gone.
pub(crate) fn fail_queued(outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
    while let Ok(job) = outbound.try_recv() {
        let _ = job
            .done
            .send(Err(Error::ConnectionClosed("connection lost".to_string())));
    }
}
