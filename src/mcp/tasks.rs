//! Tasks: asynchronous tool executions tracked as records the client can poll.
//!
//! The store assigns ids, keeps records in creation order and publishes every
//! status change on an update channel (forwarded as `notifications/tasks/status`
//! by the server).

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::lock;
use crate::types::{Task, TaskStatus, ToolResult};

struct TaskEntry {
    task: Task,
    result: Option<ToolResult>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, TaskEntry>,
    order: Vec<String>,
}

/// Task records owned by one server.
pub struct TaskStore {
    inner: Mutex<Inner>,
    updates_tx: mpsc::UnboundedSender<Task>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
}

impl Default for TaskStore {
    fn default() -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(Inner::default()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }
}

impl TaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Status changes, handed out once.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<Task>> {
        lock(&self.updates_rx).take()
    }

    /// Create a `Working` task.
    pub fn create(&self, ttl: Option<u64>, poll_interval: Option<u64>) -> Task {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            status: TaskStatus::Working,
            status_message: None,
            created_at: now,
            last_updated_at: now,
            ttl,
            poll_interval,
        };

        let mut inner = lock(&self.inner);
        inner.order.push(task.task_id.clone());
        inner.entries.insert(
            task.task_id.clone(),
            TaskEntry {
                task: task.clone(),
                result: None,
                cancel: CancellationToken::new(),
            },
        );
        debug!("task {} created", task.task_id);
        task
    }

    pub fn get(&self, task_id: &str) -> Result<Task> {
        lock(&self.inner)
            .entries
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// All tasks in creation order.
    pub fn list(&self) -> Vec<Task> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate<F>(&self, task_id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut TaskEntry) -> Result<()>,
    {
        let task = {
            let mut inner = lock(&self.inner);
            let entry = inner
                .entries
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
            f(entry)?;
            entry.task.last_updated_at = Utc::now();
            entry.task.clone()
        };
        debug!("task {} -> {}", task.task_id, task.status);
        let _ = self.updates_tx.send(task.clone());
        Ok(task)
    }

    /// Set a non-terminal status (`working` / `input_required`).
    pub fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<Task> {
        self.mutate(task_id, |entry| {
            entry.task.status = status;
            entry.task.status_message = message;
            Ok(())
        })
    }

    /// Finish a task: `Failed` when an error message is given, else `Completed`.
    ///
    /// A cancelled task stays cancelled; finishing it is rejected.
    pub fn complete(
        &self,
        task_id: &str,
        result: Option<ToolResult>,
        error_message: Option<String>,
    ) -> Result<Task> {
        self.mutate(task_id, |entry| {
            if entry.task.status == TaskStatus::Cancelled {
                return Err(Error::InvalidParams(format!(
                    "task {} is cancelled",
                    task_id
                )));
            }
            entry.task.status = if error_message.is_some() {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            entry.task.status_message = error_message;
            entry.result = result;
            Ok(())
        })
    }

    pub fn fail(&self, task_id: &str, message: impl Into<String>) -> Result<Task> {
        self.complete(task_id, None, Some(message.into()))
    }

    /// Cancel a task whatever its state, signalling its cancellation token.
    pub fn cancel(&self, task_id: &str) -> Result<Task> {
        self.mutate(task_id, |entry| {
            entry.cancel.cancel();
            entry.task.status = TaskStatus::Cancelled;
            entry.task.status_message = Some("cancelled".to_string());
            Ok(())
        })
    }

    /// The outcome of a completed or failed task.
    pub fn result(&self, task_id: &str) -> Result<ToolResult> {
        let inner = lock(&self.inner);
        let entry = inner
            .entries
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        match entry.task.status {
            TaskStatus::Completed => Ok(entry.result.clone().unwrap_or_default()),
            TaskStatus::Failed => Ok(entry.result.clone().unwrap_or_else(|| {
                ToolResult::error(
                    entry
                        .task
                        .status_message
                        .clone()
                        .unwrap_or_else(|| "task failed".to_string()),
                )
            })),
            other => Err(Error::InvalidParams(format!(
                "task {} is {}; no result yet",
                task_id, other
            ))),
        }
    }

    pub fn cancellation_token(&self, task_id: &str) -> Option<CancellationToken> {
        lock(&self.inner)
            .entries
            .get(task_id)
            .map(|e| e.cancel.clone())
    }

    /// Drop tasks whose ttl elapsed since their last update. Returns how many.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = lock(&self.inner);
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| match e.task.ttl {
                Some(ttl) => {
                    let age = now.signed_duration_since(e.task.last_updated_at);
                    age.num_milliseconds() >= ttl as i64
                }
                None => false,
            })
            .map(|e| e.task.task_id.clone())
            .collect();

        for id in &expired {
            inner.entries.remove(id);
        }
        inner.order.retain(|id| !expired.contains(id));
        if !expired.is_empty() {
            info!("evicted {} expired tasks", expired.len());
        }
        expired.len()
    }
}

/// What an async tool handler uses to report on its task.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    store: Arc<TaskStore>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn new(store: Arc<TaskStore>, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let cancel = store
            .cancellation_token(&task_id)
            .unwrap_or_default();
        Self {
            task_id,
            store,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.task_id
    }

    pub fn task(&self) -> Result<Task> {
        self.store.get(&self.task_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn input_required(&self, message: impl Into<String>) -> Result<Task> {
        self.store
            .set_status(&self.task_id, TaskStatus::InputRequired, Some(message.into()))
    }

    pub fn working(&self, message: Option<String>) -> Result<Task> {
        self.store
            .set_status(&self.task_id, TaskStatus::Working, message)
    }

    pub fn complete(&self, result: ToolResult) -> Result<Task> {
        self.store.complete(&self.task_id, Some(result), None)
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<Task> {
        self.store.fail(&self.task_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_starts_working() {
        let store = TaskStore::new();
        let task = store.create(Some(60_000), Some(500));
        assert_eq!(task.status, TaskStatus::Working);
        assert_eq!(task.created_at, task.last_updated_at);
        assert_eq!(task.ttl, Some(60_000));
        assert_eq!(store.get(&task.task_id).unwrap(), task);
    }

    #[test]
    fn test_complete_and_result() {
        let store = TaskStore::new();
        let task = store.create(None, None);

        let err = store.result(&task.task_id).unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));

        let done = store
            .complete(&task.task_id, Some(ToolResult::text("done")), None)
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.last_updated_at >= done.created_at);

        let result = store.result(&task.task_id).unwrap();
        assert_eq!(result.content[0].as_text(), Some("done"));
        assert!(!result.is_error);
    }

    #[test]
    fn test_complete_with_error_fails() {
        let store = TaskStore::new();
        let task = store.create(None, None);
        let failed = store
            .complete(&task.task_id, None, Some("exploded".to_string()))
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.status_message.as_deref(), Some("exploded"));

        let result = store.result(&task.task_id).unwrap();
        assert!(result.is_error);
        assert_eq!(result.content[0].as_text(), Some("exploded"));
    }

    #[test]
    fn test_cancel_is_unconditional_and_sticky() {
        let store = TaskStore::new();
        let task = store.create(None, None);
        let token = store.cancellation_token(&task.task_id).unwrap();

        store.cancel(&task.task_id).unwrap();
        assert!(token.is_cancelled());
        assert_eq!(store.get(&task.task_id).unwrap().status, TaskStatus::Cancelled);

        // A late completion is refused, and cancel still succeeds.
        let mut updates = store.take_updates().unwrap();
        while updates.try_recv().is_ok() {}
        let late = store.complete(&task.task_id, Some(ToolResult::text("late")), None);
        assert!(matches!(late, Err(Error::InvalidParams(_))));
        assert!(matches!(
            store.fail(&task.task_id, "too late"),
            Err(Error::InvalidParams(_))
        ));
        assert!(updates.try_recv().is_err());
        assert_eq!(store.cancel(&task.task_id).unwrap().status, TaskStatus::Cancelled);
        assert!(store.result(&task.task_id).is_err());
    }

    #[test]
    fn test_complete_without_result_or_error() {
        let store = TaskStore::new();
        let task = store.create(None, None);
        let done = store.complete(&task.task_id, None, None).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.status_message.is_none());

        let result = store.result(&task.task_id).unwrap();
        assert!(!result.is_error);
        assert!(result.content.is_empty());
    }

    #[test]
    fn test_unknown_task() {
        let store = TaskStore::new();
        assert!(matches!(store.get("nope"), Err(Error::TaskNotFound(_))));
        assert!(matches!(store.cancel("nope"), Err(Error::TaskNotFound(_))));
    }

    #[test]
    fn test_list_in_creation_order() {
        let store = TaskStore::new();
        let ids: Vec<String> = (0..4).map(|_| store.create(None, None).task_id).collect();
        let listed: Vec<String> = store.list().into_iter().map(|t| t.task_id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_evict_expired() {
        let store = TaskStore::new();
        let short = store.create(Some(0), None);
        let kept = store.create(Some(3_600_000), None);
        let forever = store.create(None, None);

        assert_eq!(store.evict_expired(), 1);
        assert!(store.get(&short.task_id).is_err());
        assert!(store.get(&kept.task_id).is_ok());
        assert!(store.get(&forever.task_id).is_ok());
        assert_eq!(store.list().len(), 2);
    }

    #[tokio::test]
    async fn test_updates_channel_and_handle() {
        let store = TaskStore::new();
        let mut updates = store.take_updates().unwrap();
        assert!(store.take_updates().is_none());

        let task = store.create(None, None);
        let handle = TaskHandle::new(store.clone(), &task.task_id);

        handle.input_required("need a file").unwrap();
        handle.complete(ToolResult::text("ok")).unwrap();

        let first = updates.recv().await.unwrap();
        assert_eq!(first.status, TaskStatus::InputRequired);
        let second = updates.recv().await.unwrap();
        assert_eq!(second.status, TaskStatus::Completed);
        assert!(!handle.is_cancelled());
    }
}
