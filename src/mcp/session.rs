//! Session state shared by the client and server roles.
//!
//! A [`Session`] owns one transport, the lifecycle state machine and the
//! table of requests awaiting a response. The event loop started by
//! [`spawn_event_loop`] is the single consumer of the transport's events: it
//! resolves responses inline, hands requests and notifications to the role
//! (a [`SessionPeer`]) and tears the session down when the transport goes away.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::codec::Message;
use crate::mcp::protocol::{
    methods, CancelledParams, JsonRpcNotification, JsonRpcRequest, RequestId,
};
use crate::metrics::Metrics;
use crate::transport::{EventReceiver, Transport, TransportEvent, TransportState};

/// Which side of the protocol a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::Client => "c",
            Self::Server => "s",
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Closing,
    Error,
}

impl SessionState {
    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Initializing)
                | (Connecting, Initializing | Closing | Error | Disconnected)
                | (Initializing, Ready | Closing | Error | Disconnected)
                | (Ready, Closing | Error | Disconnected)
                | (Closing, Disconnected | Error)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A request waiting for its response.
pub struct PendingRequest {
    pub method: String,
    completion: oneshot::Sender<Result<Value>>,
}

impl PendingRequest {
    /// Complete the waiting caller. A caller that gave up is ignored.
    pub fn resolve(self, result: Result<Value>) {
        let _ = self.completion.send(result);
    }
}

/// Correlation table from request id to the waiting caller.
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<RequestId, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; an id that is still pending is refused.
    pub fn add(
        &self,
        id: RequestId,
        method: impl Into<String>,
        completion: oneshot::Sender<Result<Value>>,
    ) -> Result<()> {
        match self.entries.entry(id) {
            Entry::Occupied(entry) => Err(Error::InvalidRequest(format!(
                "request id {} is already pending",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    method: method.into(),
                    completion,
                });
                Ok(())
            }
        }
    }

    /// Remove the waiter for `id`. Only one caller ever gets it.
    pub fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        self.entries.remove(id).map(|(_, pending)| pending)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Fail every waiter with `ConnectionClosed`. Returns how many were failed.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some(pending) = self.take(&id) {
                debug!("failing pending {} ({}): {}", id, pending.method, reason);
                pending.resolve(Err(Error::ConnectionClosed(reason.to_string())));
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One protocol session over one transport.
pub struct Session {
    role: Role,
    transport: Arc<dyn Transport>,
    state: watch::Sender<SessionState>,
    terminated: AtomicBool,
    next_id: AtomicU64,
    pending: PendingRequests,
    metrics: Arc<Metrics>,
}

impl Session {
    pub fn new(role: Role, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            role,
            transport,
            state,
            terminated: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: PendingRequests::new(),
            metrics,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Whether the session reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Move the lifecycle forward along the allowed edges.
    pub fn set_state(&self, next: SessionState) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::ConnectionClosed(format!(
                "session is {}",
                self.state()
            )));
        }
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_move_to(next) {
            return Err(Error::Internal(format!(
                "invalid session transition {} -> {}",
                current, next
            )));
        }
        debug!("{:?} session: {} -> {}", self.role, current, next);
        self.state.send_replace(next);
        Ok(())
    }

    /// Enter a terminal state and fail every pending request.
    pub fn terminate(&self, state: SessionState, reason: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{:?} session {} ({})", self.role, state, reason);
        self.state.send_replace(state);
        let cancelled = self.pending.cancel_all(reason);
        if cancelled > 0 {
            self.metrics.add_pending_cancelled(cancelled as u64);
        }
    }

    /// A fresh session-unique id (`c-1`, `s-1`, ...).
    pub fn next_request_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        RequestId::String(format!("{}-{}", self.role.id_prefix(), n))
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.transport.send(message).await?;
        self.metrics.inc_sent();
        Ok(())
    }

    /// Add a pending entry unless the session has been torn down.
    ///
    /// `terminate` flags the session before it drains the table, so an entry
    /// added after the drain is caught by the second check.
    fn register_pending(
        &self,
        id: &RequestId,
        method: &str,
        completion: oneshot::Sender<Result<Value>>,
    ) -> Result<()> {
        self.pending.add(id.clone(), method, completion)?;
        if self.is_terminated() {
            self.pending.take(id);
            return Err(Error::ConnectionClosed(format!("session is {}", self.state())));
        }
        Ok(())
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_cancel(method, params, None).await
    }

    /// Send a request that the caller may abandon through `cancel`.
    ///
    /// Cancelling removes the pending entry, tells the peer through
    /// `notifications/cancelled` and resolves with [`Error::Cancelled`].
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        match self.state() {
            SessionState::Connecting | SessionState::Initializing | SessionState::Ready => {}
            other => {
                return Err(Error::ConnectionClosed(format!("session is {}", other)));
            }
        }

        let id = self.next_request_id();
        let (tx, mut rx) = oneshot::channel();
        self.register_pending(&id, method, tx)?;
        debug!("-> {} {}", id, method);

        if let Err(e) = self
            .send(Message::request(id.clone(), method, params))
            .await
        {
            self.pending.take(&id);
            return Err(e);
        }

        let received = match cancel {
            None => rx.await,
            Some(token) => tokio::select! {
                received = &mut rx => received,
                _ = token.cancelled() => {
                    if self.pending.take(&id).is_some() {
                        let reason = "cancelled by caller".to_string();
                        let params = CancelledParams {
                            request_id: id.clone(),
                            reason: Some(reason.clone()),
                        };
                        if let Err(e) = self
                            .notify(methods::NOTIFY_CANCELLED, Some(serde_json::to_value(params)?))
                            .await
                        {
                            debug!("could not announce cancellation of {}: {}", id, e);
                        }
                        return Err(Error::Cancelled(reason));
                    }
                    // The response won the race.
                    rx.await
                }
            },
        };

        received.map_err(|_| Error::ConnectionClosed("request abandoned".to_string()))?
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(Message::notification(method, params)).await?;
        self.metrics.inc_notifications();
        Ok(())
    }

    /// Answer an inbound request.
    pub async fn respond(&self, id: RequestId, result: Result<Value>) -> Result<()> {
        let message = match result {
            Ok(value) => {
                self.metrics.inc_handled();
                Message::response(id, value)
            }
            Err(e) => {
                self.metrics.inc_failed();
                debug!("request {} failed: {}", id, e);
                Message::error(Some(id), e.to_jsonrpc())
            }
        };
        self.send(message).await
    }

    /// Route a response or error envelope to its waiter.
    pub fn resolve(&self, message: Message) {
        let (id, result) = match message {
            Message::Response(res) => (res.id, Ok(res.result)),
            Message::Error(err) => match err.id {
                Some(id) => (id, Err(Error::from_jsonrpc(err.error))),
                None => {
                    warn!(
                        "peer reported an error without an id: {} ({})",
                        err.error.message, err.error.code
                    );
                    return;
                }
            },
            other => {
                debug!("resolve called with a {:?}", other.kind());
                return;
            }
        };

        match self.pending.take(&id) {
            Some(pending) => {
                debug!("<- {} {}", id, pending.method);
                pending.resolve(result);
            }
            None => warn!("dropping response for unknown or completed request {}", id),
        }
    }

    /// Fail the pending request named by an inbound `notifications/cancelled`.
    pub fn cancel_request(&self, params: Option<&Value>) -> Option<CancelledParams> {
        let params: CancelledParams = params
            .cloned()
            .and_then(|p| serde_json::from_value(p).ok())?;
        if let Some(pending) = self.pending.take(&params.request_id) {
            let reason = params
                .reason
                .clone()
                .unwrap_or_else(|| "cancelled by peer".to_string());
            debug!("peer cancelled {} ({})", params.request_id, pending.method);
            pending.resolve(Err(Error::Cancelled(reason)));
        }
        Some(params)
    }
}

/// A protocol role driven by the session event loop.
#[async_trait]
pub trait SessionPeer: Clone + Send + Sync + 'static {
    fn session(&self) -> &Arc<Session>;

    /// An inbound request. The peer owes exactly one answer per request.
    async fn on_request(&self, request: JsonRpcRequest);

    /// An inbound notification. `notifications/cancelled` was already applied
    /// to the pending table.
    async fn on_notification(&self, notification: JsonRpcNotification);

    /// A non-fatal transport error.
    fn on_transport_error(&self, _error: &Error) {}

    /// The session reached a terminal state.
    fn on_closed(&self, _state: SessionState) {}
}

/// Consume `events` on behalf of `peer` until the transport goes away.
pub fn spawn_event_loop<P: SessionPeer>(peer: P, mut events: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session = peer.session().clone();

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => {
                    session.metrics.inc_received();
                    match message {
                        Message::Response(_) | Message::Error(_) => session.resolve(message),
                        Message::Request(request) => peer.on_request(request).await,
                        Message::Notification(notification) => {
                            if notification.method == methods::NOTIFY_CANCELLED {
                                session.cancel_request(notification.params.as_ref());
                            }
                            peer.on_notification(notification).await;
                        }
                    }
                }
                TransportEvent::StateChanged { old, new } => match new {
                    TransportState::Disconnected | TransportState::Error => {
                        let state = if new == TransportState::Error {
                            SessionState::Error
                        } else {
                            SessionState::Disconnected
                        };
                        session.terminate(state, &format!("transport {}", new));
                        peer.on_closed(state);
                        break;
                    }
                    TransportState::Connecting if old == TransportState::Connected => {
                        let cancelled = session.pending.cancel_all("transport reconnecting");
                        if cancelled > 0 {
                            session.metrics.add_pending_cancelled(cancelled as u64);
                        }
                    }
                    _ => {}
                },
                TransportEvent::Error(e) => {
                    debug!("{} transport error: {}", session.transport.kind(), e);
                    peer.on_transport_error(&e);
                }
            }
        }

        debug!("{:?} session event loop finished", session.role);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StdioTransport;

    fn idle_session(role: Role) -> Session {
        let (a, _b) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(a);
        Session::new(
            role,
            Arc::new(StdioTransport::from_streams(read, write)),
            Metrics::new(),
        )
    }

    #[test]
    fn test_request_ids_are_prefixed_and_unique() {
        let client = idle_session(Role::Client);
        assert_eq!(client.next_request_id(), RequestId::from("c-1"));
        assert_eq!(client.next_request_id(), RequestId::from("c-2"));

        let server = idle_session(Role::Server);
        assert_eq!(server.next_request_id(), RequestId::from("s-1"));
    }

    #[test]
    fn test_state_machine_edges() {
        let session = idle_session(Role::Client);
        assert!(session.set_state(SessionState::Ready).is_err());
        session.set_state(SessionState::Connecting).unwrap();
        session.set_state(SessionState::Initializing).unwrap();
        session.set_state(SessionState::Ready).unwrap();
        assert!(session.set_state(SessionState::Initializing).is_err());

        session.terminate(SessionState::Disconnected, "test");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.set_state(SessionState::Connecting).is_err());
    }

    #[tokio::test]
    async fn test_pending_add_take_once() {
        let pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.add(RequestId::from("c-1"), "ping", tx).unwrap();

        let (dup, _) = oneshot::channel();
        assert!(pending.add(RequestId::from("c-1"), "ping", dup).is_err());

        let entry = pending.take(&RequestId::from("c-1")).unwrap();
        assert_eq!(entry.method, "ping");
        assert!(pending.take(&RequestId::from("c-1")).is_none());

        entry.resolve(Ok(serde_json::json!({})));
        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_every_waiter() {
        let pending = PendingRequests::new();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = oneshot::channel();
            pending
                .add(RequestId::String(format!("c-{}", i)), "tools/list", tx)
                .unwrap();
            receivers.push(rx);
        }
        assert_eq!(pending.len(), 5);

        assert_eq!(pending.cancel_all("gone"), 5);
        assert!(pending.is_empty());
        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(err.is_connection_closed());
        }
    }

    #[tokio::test]
    async fn test_resolve_routes_results_and_errors() {
        let session = idle_session(Role::Client);
        let (tx, rx) = oneshot::channel();
        session
            .pending()
            .add(RequestId::from("c-9"), "tools/call", tx)
            .unwrap();

        session.resolve(Message::error(
            Some(RequestId::from("c-9")),
            Error::MethodNotFound("nope".to_string()).to_jsonrpc(),
        ));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::MethodNotFound);

        // A late duplicate finds nothing.
        session.resolve(Message::response(
            RequestId::from("c-9"),
            serde_json::json!({}),
        ));
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_cancel_fails_pending() {
        let session = idle_session(Role::Server);
        let (tx, rx) = oneshot::channel();
        session
            .pending()
            .add(RequestId::from("s-1"), "sampling/createMessage", tx)
            .unwrap();

        let params = serde_json::json!({"requestId": "s-1", "reason": "user"});
        let parsed = session.cancel_request(Some(&params)).unwrap();
        assert_eq!(parsed.request_id, RequestId::from("s-1"));
        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled(reason)) if reason == "user"));
    }

    #[tokio::test]
    async fn test_request_refused_when_closed() {
        let session = idle_session(Role::Client);
        session.terminate(SessionState::Error, "boom");
        let err = session.request("ping", None).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_pending_entry_added_after_terminate_is_dropped() {
        let session = idle_session(Role::Client);
        session.set_state(SessionState::Connecting).unwrap();
        session.terminate(SessionState::Disconnected, "gone");

        let (tx, rx) = oneshot::channel();
        let err = session
            .register_pending(&RequestId::from("c-9"), "ping", tx)
            .unwrap_err();
        assert!(err.is_connection_closed());
        assert!(session.pending().is_empty());
        // The completion was dropped with the entry, so nobody waits on it.
        assert!(rx.await.is_err());
    }
}
