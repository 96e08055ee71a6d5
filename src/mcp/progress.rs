//! MCP Progress Notifications
//!
//! Support for emitting progress updates during long-running operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::mcp::protocol::methods;
use crate::mcp::session::Session;

/// Progress token for tracking operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Number(i64),
}

impl ProgressToken {
    /// Read a token out of a request's `_meta.progressToken`.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Progress notification params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Progress reporter bound to one token and one session.
#[derive(Clone)]
pub struct ProgressReporter {
    token: ProgressToken,
    total: Option<f64>,
    session: Arc<Session>,
}

impl ProgressReporter {
    pub fn new(token: ProgressToken, total: Option<f64>, session: Arc<Session>) -> Self {
        Self {
            token,
            total,
            session,
        }
    }

    pub fn token(&self) -> &ProgressToken {
        &self.token
    }

    /// Send a progress notification for this reporter.
    pub async fn report(&self, progress: f64, message: Option<&str>) -> Result<()> {
        let params = ProgressParams {
            progress_token: self.token.clone(),
            progress,
            total: self.total,
            message: message.map(String::from),
        };
        debug!("progress {:?}: {}", self.token, progress);
        self.session
            .notify(
                methods::NOTIFY_PROGRESS,
                Some(serde_json::to_value(params)?),
            )
            .await
    }

    /// Report a percentage, scaled to `total` when one is set.
    pub async fn report_percent(&self, percent: f64, message: Option<&str>) -> Result<()> {
        let progress = match self.total {
            Some(total) => percent * total / 100.0,
            None => percent,
        };
        self.report(progress, message).await
    }
}
