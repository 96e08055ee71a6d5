//! Protocol counters with Prometheus text rendering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// `Content-Type` of [`Metrics::to_prometheus`] output.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Metrics collector.
///
/// One instance is usually shared by every session a process runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Envelopes received from peers
    pub messages_received: AtomicU64,
    /// Envelopes written to peers
    pub messages_sent: AtomicU64,
    /// Inbound requests answered with a result
    pub requests_handled: AtomicU64,
    /// Inbound requests answered with an error
    pub requests_failed: AtomicU64,
    /// Outbound notifications
    pub notifications_sent: AtomicU64,
    /// Pending outbound requests failed by cancellation or disconnect
    pub pending_cancelled: AtomicU64,
    /// Tool calls dispatched
    pub tool_calls: AtomicU64,
    /// Tasks created
    pub tasks_created: AtomicU64,
    /// Live sessions
    pub active_sessions: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pending_cancelled(&self, count: u64) {
        self.pending_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_tool_calls(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks(&self) {
        self.tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            pending_cancelled: self.pending_cancelled.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tasks_created: self.tasks_created.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP mcp_engine_messages_received_total Envelopes received
# TYPE mcp_engine_messages_received_total counter
mcp_engine_messages_received_total {}

# HELP mcp_engine_messages_sent_total Envelopes sent
# TYPE mcp_engine_messages_sent_total counter
mcp_engine_messages_sent_total {}

# HELP mcp_engine_requests_handled_total Requests answered with a result
# TYPE mcp_engine_requests_handled_total counter
mcp_engine_requests_handled_total {}

# HELP mcp_engine_requests_failed_total Requests answered with an error
# TYPE mcp_engine_requests_failed_total counter
mcp_engine_requests_failed_total {}

# HELP mcp_engine_notifications_sent_total Notifications sent
# TYPE mcp_engine_notifications_sent_total counter
mcp_engine_notifications_sent_total {}

# HELP mcp_engine_pending_cancelled_total Pending requests failed before a response arrived
# TYPE mcp_engine_pending_cancelled_total counter
mcp_engine_pending_cancelled_total {}

# HELP mcp_engine_tool_calls_total Tool calls dispatched
# TYPE mcp_engine_tool_calls_total counter
mcp_engine_tool_calls_total {}

# HELP mcp_engine_tasks_created_total Tasks created
# TYPE mcp_engine_tasks_created_total counter
mcp_engine_tasks_created_total {}

# HELP mcp_engine_active_sessions Live sessions
# TYPE mcp_engine_active_sessions gauge
mcp_engine_active_sessions {}
"#,
            s.messages_received,
            s.messages_sent,
            s.requests_handled,
            s.requests_failed,
            s.notifications_sent,
            s.pending_cancelled,
            s.tool_calls,
            s.tasks_created,
            s.active_sessions
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub requests_handled: u64,
    pub requests_failed: u64,
    pub notifications_sent: u64,
    pub pending_cancelled: u64,
    pub tool_calls: u64,
    pub tasks_created: u64,
    pub active_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.inc_received();
        metrics.inc_received();
        metrics.inc_sent();
        metrics.inc_failed();
        metrics.add_pending_cancelled(3);

        let s = metrics.snapshot();
        assert_eq!(s.messages_received, 2);
        assert_eq!(s.messages_sent, 1);
        assert_eq!(s.requests_failed, 1);
        assert_eq!(s.pending_cancelled, 3);
    }

    #[test]
    fn test_active_sessions_saturate() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_closed();
        metrics.session_closed();
        assert_eq!(metrics.snapshot().active_sessions, 0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.inc_tool_calls();
        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE mcp_engine_tool_calls_total counter"));
        assert!(text.contains("mcp_engine_tool_calls_total 1"));
        assert!(text.contains("mcp_engine_active_sessions 0"));
    }
}
