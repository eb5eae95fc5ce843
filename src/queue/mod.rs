//! Durable FIFO of tasks plus a keyed, expiring status per task.
//!
//! The queue itself never looks inside a payload: a [`Task`] is a kind tag
//! plus opaque bytes, and the handler registered for that kind decodes them.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::consts::{DEFAULT_POP_TIMEOUT, DEFAULT_STATUS_TTL, TASK_QUEUE_KEY, status_key};
use crate::error::PipelineError;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A question cast and interpreted on its own.
    Divination,
    /// A two-person relationship reading.
    Compatibility,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Divination => f.write_str("divination"),
            TaskKind::Compatibility => f.write_str("compatibility"),
        }
    }
}

/// A unit of queued work. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    #[serde(serialize_with = "encode_payload", deserialize_with = "decode_payload")]
    pub payload: Vec<u8>,
    /// Who asked: a user id or device hash. Used for quotas and records.
    pub owner_hint: String,
    pub submitted_at: DateTime<Utc>,
}

fn encode_payload<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(bytes))
}

fn decode_payload<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(d)?;
    STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

/// The fields of a queue message that survive a kind or payload this build
/// can't read.
#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(default)]
    kind: Option<serde_json::Value>,
}

/// Decode a popped message. When only the id can be recovered the error
/// carries it, so the task can still be given a terminal status.
fn decode_message(message: &[u8]) -> Result<Task, PipelineError> {
    let err = match serde_json::from_slice::<Task>(message) {
        Ok(task) => return Ok(task),
        Err(e) => e,
    };
    match serde_json::from_slice::<Envelope>(message) {
        Ok(envelope) => {
            let unknown_kind = envelope
                .kind
                .is_none_or(|kind| serde_json::from_value::<TaskKind>(kind).is_err());
            Err(PipelineError::Undecodable {
                task_id: envelope.id,
                unknown_kind,
                reason: err.to_string(),
            })
        }
        Err(_) => Err(PipelineError::Malformed(err.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// What a poller sees. Every write replaces the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    fn new(state: TaskState, result: Option<serde_json::Value>, error: Option<String>) -> Self {
        Self {
            state,
            result,
            error,
            updated_at: Utc::now(),
        }
    }
}

pub struct WorkQueue {
    store: Arc<dyn KeyValueStore>,
    status_ttl: Duration,
    pop_timeout: Duration,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            status_ttl: DEFAULT_STATUS_TTL,
            pop_timeout: DEFAULT_POP_TIMEOUT,
        }
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Record the task as Pending, then make it available to workers.
    ///
    /// The status is written first so a worker that pops the task right away
    /// never races ahead of it. If the push fails the Pending status is
    /// retracted (best effort) and the error is returned.
    pub async fn enqueue(&self, task: &Task) -> Result<(), PipelineError> {
        let message = serde_json::to_vec(task)
            .map_err(|e| PipelineError::Malformed(e.to_string()))?;

        self.write_status(&task.id, &TaskStatus::new(TaskState::Pending, None, None))
            .await?;

        if let Err(e) = self.store.push(TASK_QUEUE_KEY, message).await {
            if let Err(cleanup) = self.store.delete(&status_key(&task.id)).await {
                tracing::warn!(task = %task.id, error = %cleanup, "could not retract pending status");
            }
            return Err(e.into());
        }
        tracing::debug!(task = %task.id, kind = %task.kind, "task enqueued");
        Ok(())
    }

    /// Wait for the next task. Returns [`PipelineError::Cancelled`] once
    /// `cancel` fires; a task is never lost to cancellation because the pop
    /// itself completes or doesn't happen at all.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Task, PipelineError> {
        loop {
            let popped = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                popped = self.store.pop_blocking(TASK_QUEUE_KEY, self.pop_timeout) => popped?,
            };
            if let Some(message) = popped {
                return decode_message(&message);
            }
        }
    }

    /// Overwrite the status of `task_id` and restart its TTL.
    pub async fn update_status(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), PipelineError> {
        self.write_status(task_id, &TaskStatus::new(state, result, error))
            .await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, PipelineError> {
        let raw = self
            .store
            .get(&status_key(task_id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(task_id.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| PipelineError::Malformed(e.to_string()))
    }

    /// Number of tasks waiting to be picked up.
    pub async fn backlog(&self) -> Result<usize, PipelineError> {
        Ok(self.store.list_len(TASK_QUEUE_KEY).await?)
    }

    async fn write_status(&self, task_id: &str, status: &TaskStatus) -> Result<(), PipelineError> {
        let bytes =
            serde_json::to_vec(status).map_err(|e| PipelineError::Malformed(e.to_string()))?;
        self.store
            .set_with_ttl(&status_key(task_id), bytes, self.status_ttl)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultyStore, MemoryStore};

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            kind: TaskKind::Divination,
            payload: br#"{"question":"will it rain"}"#.to_vec(),
            owner_hint: "device-1".to_string(),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn task_payload_is_base64_on_the_wire() {
        let t = task("t1");
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"], "divination");
        assert!(json["payload"].as_str().unwrap().starts_with("eyJ"));
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn status_omits_absent_fields() {
        let status = TaskStatus::new(TaskState::Pending, None, None);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "pending");
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn enqueue_writes_pending_before_task_is_visible() {
        let queue = WorkQueue::new(Arc::new(MemoryStore::new()));
        queue.enqueue(&task("t1")).await.unwrap();

        let status = queue.get_status("t1").await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(queue.backlog().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dequeue_returns_tasks_in_order() {
        let queue = WorkQueue::new(Arc::new(MemoryStore::new()));
        for id in ["a", "b", "c"] {
            queue.enqueue(&task(id)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        for id in ["a", "b", "c"] {
            assert_eq!(queue.dequeue(&cancel).await.unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn dequeue_honours_cancellation() {
        let queue = WorkQueue::new(Arc::new(MemoryStore::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = queue.dequeue(&cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let queue = WorkQueue::new(Arc::new(MemoryStore::new()));
        let err = queue.get_status("missing").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn update_overwrites_whole_status() {
        let queue = WorkQueue::new(Arc::new(MemoryStore::new()));
        queue
            .update_status("t", TaskState::Failed, None, Some("boom".to_string()))
            .await
            .unwrap();
        queue
            .update_status(
                "t",
                TaskState::Completed,
                Some(serde_json::json!({"ok": true})),
                None,
            )
            .await
            .unwrap();
        let status = queue.get_status("t").await.unwrap();
        assert_eq!(status.state, TaskState::Completed);
        assert!(status.error.is_none());
        assert_eq!(status.result.unwrap()["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn status_expires_after_ttl() {
        let queue = WorkQueue::new(Arc::new(MemoryStore::new()))
            .with_status_ttl(Duration::from_secs(60));
        queue.enqueue(&task("t1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            queue.get_status("t1").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_surfaces_backend_outage() {
        let store = Arc::new(FaultyStore::new());
        store.set_available(false);
        let queue = WorkQueue::new(store);
        let err = queue.enqueue(&task("t1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn malformed_message_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.push(TASK_QUEUE_KEY, b"not json".to_vec()).await.unwrap();
        let queue = WorkQueue::new(store);
        let err = queue.dequeue(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
    }

    #[tokio::test]
    async fn foreign_kind_keeps_its_task_id() {
        let store = Arc::new(MemoryStore::new());
        store
            .push(
                TASK_QUEUE_KEY,
                br#"{"id":"w1","kind":"wish","payload":"","owner_hint":"","submitted_at":"2024-06-10T06:00:00Z"}"#.to_vec(),
            )
            .await
            .unwrap();
        let queue = WorkQueue::new(store);
        let err = queue.dequeue(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Undecodable { task_id, unknown_kind: true, .. } if task_id == "w1"
        ));
    }

    #[tokio::test]
    async fn broken_payload_keeps_its_task_id() {
        let store = Arc::new(MemoryStore::new());
        store
            .push(
                TASK_QUEUE_KEY,
                br#"{"id":"p1","kind":"divination","payload":"%%%"}"#.to_vec(),
            )
            .await
            .unwrap();
        let queue = WorkQueue::new(store);
        let err = queue.dequeue(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Undecodable { task_id, unknown_kind: false, .. } if task_id == "p1"
        ));
    }
}
