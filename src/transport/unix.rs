//! Unix-domain socket listener.
//!
//! Every accepted connection gets its own NDJSON transport and its own
//! [`Server`]. A hook configures each server (registering tools, resources,
//! prompts) before its handshake starts.

use dashmap::DashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{lock, StdioTransport};
use crate::error::{Error, Result};
use crate::mcp::server::{Server, ServerConfig};
use crate::metrics::Metrics;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Called with every new per-connection server before it starts.
pub type SessionHook = Arc<dyn Fn(&Server) + Send + Sync>;

/// Unix listener configuration.
#[derive(Clone)]
pub struct UnixListenerConfig {
    pub path: PathBuf,
    pub server: ServerConfig,
    pub on_session: Option<SessionHook>,
}

impl UnixListenerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            server: ServerConfig::default(),
            on_session: None,
        }
    }

    pub fn with_hook(mut self, hook: impl Fn(&Server) + Send + Sync + 'static) -> Self {
        self.on_session = Some(Arc::new(hook));
        self
    }
}

impl Default for UnixListenerConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("mcp-engine.sock"))
    }
}

impl std::fmt::Debug for UnixListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixListenerConfig")
            .field("path", &self.path)
            .field("server", &self.server)
            .field("on_session", &self.on_session.is_some())
            .finish()
    }
}

/// Per-connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    SessionCreated { id: u64 },
    SessionClosed { id: u64, reason: String },
}

struct Shared {
    config: UnixListenerConfig,
    metrics: Arc<Metrics>,
    sessions: DashMap<u64, Server>,
    next_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl Shared {
    fn spawn_session(self: &Arc<Self>, stream: UnixStream) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (read, write) = stream.into_split();
        let server = Server::with_metrics(
            Arc::new(StdioTransport::from_streams(read, write)),
            self.config.server.clone(),
            self.metrics.clone(),
        );
        if let Some(hook) = &self.config.on_session {
            hook(&server);
        }
        self.sessions.insert(id, server.clone());
        let _ = self.events_tx.send(ListenerEvent::SessionCreated { id });
        debug!("unix session {} accepted", id);

        let shared = self.clone();
        tokio::spawn(async move {
            let reason = match server.start().await {
                Ok(()) => format!("session {}", server.closed().await),
                Err(e) => {
                    debug!("unix session {} ended before ready: {}", id, e);
                    server.closed().await;
                    e.to_string()
                }
            };
            shared.sessions.remove(&id);
            info!("unix session {} closed ({})", id, reason);
            let _ = shared
                .events_tx
                .send(ListenerEvent::SessionClosed { id, reason });
        });
    }
}

/// Listens on a Unix socket and runs one server per connection.
pub struct UnixSessionListener {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ListenerEvent>>>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl UnixSessionListener {
    pub fn new(config: UnixListenerConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    pub fn with_metrics(config: UnixListenerConfig, metrics: Arc<Metrics>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                metrics,
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.config.path
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    /// Session lifecycle events, handed out once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
        lock(&self.events_rx).take()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Bind the socket and start accepting. A stale socket file is replaced.
    pub async fn start(&self) -> Result<()> {
        if lock(&self.accept_task).is_some() {
            return Err(Error::Transport("unix listener already started".to_string()));
        }
        let path = self.shared.config.path.clone();
        remove_socket(&path)?;
        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", path.display(), e)))?;
        info!("MCP Unix listener on {}", path.display());

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let listener = &listener;
            accept_loop(
                move || async move { listener.accept().await.map(|(stream, _)| stream) },
                |stream| shared.spawn_session(stream),
                shutdown,
            )
            .await;
        });
        *lock(&self.accept_task) = Some(handle);
        Ok(())
    }

    /// Stop accepting, close every session and remove the socket file.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let handle = lock(&self.accept_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let servers: Vec<Server> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for server in servers {
            if let Err(e) = server.stop().await {
                warn!("closing unix session failed: {}", e);
            }
        }
        self.shared.sessions.clear();
        remove_socket(&self.shared.config.path)
    }
}

/// Accept connections until `shutdown`. Accept failures such as running out
/// of file descriptors are logged and retried after [`ACCEPT_RETRY_DELAY`].
async fn accept_loop<S, A, Fut>(
    mut accept: A,
    mut on_stream: impl FnMut(S),
    shutdown: CancellationToken,
) where
    A: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<S>>,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = accept() => match accepted {
                Ok(stream) => on_stream(stream),
                Err(e) => {
                    warn!("unix accept failed: {}; retrying", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            },
        }
    }
    debug!("unix accept loop finished");
}

fn remove_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
