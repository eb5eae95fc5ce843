//! The consumer side: a pool of independent loops that pull tasks off the
//! [`WorkQueue`], dispatch them by kind and write back a terminal status.
//!
//! A task is attempted once. Whatever the handler returns, success or error,
//! becomes the task's final status; nothing is re-enqueued.

pub mod compatibility;
pub mod divination;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consts::{DEFAULT_DEQUEUE_BACKOFF, DEFAULT_OUTBOUND_TIMEOUT};
use crate::divination::Clock;
use crate::error::PipelineError;
use crate::generative::{GenerativeClient, GenerativeError, Prompt};
use crate::persistence::PersistenceStore;
use crate::queue::{Task, TaskKind, TaskState, WorkQueue};
use crate::throttle::OutboundThrottle;

pub use compatibility::CompatibilityHandler;
pub use divination::DivinationHandler;

/// Failed-status message for tasks cut off by shutdown.
pub const SHUTDOWN_MESSAGE: &str = "service shutting down";
/// Failed-status message when no handler is registered for a kind.
pub const UNKNOWN_KIND_MESSAGE: &str = "unknown task type";
/// Failed-status message for a queued task whose body can't be decoded.
pub const INVALID_TASK_MESSAGE: &str = "invalid task";

/// Processes one kind of task.
///
/// The error's outermost message becomes the Failed status a submitter sees,
/// so handlers wrap internal errors with a short `.context(...)`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;
    async fn handle(&self, task: &Task, abort: &CancellationToken) -> anyhow::Result<Value>;
}

/// Handlers by kind. Filled before the pool starts and read-only after.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its own kind, replacing any earlier one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.handlers.keys().copied().collect()
    }
}

/// Shared services every handler needs, passed by handle.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub throttle: Arc<OutboundThrottle>,
    pub client: Arc<dyn GenerativeClient>,
    pub records: Arc<dyn PersistenceStore>,
    pub call_timeout: Duration,
}

impl Collaborators {
    pub fn new(
        clock: Arc<dyn Clock>,
        throttle: Arc<OutboundThrottle>,
        client: Arc<dyn GenerativeClient>,
        records: Arc<dyn PersistenceStore>,
    ) -> Self {
        Self {
            clock,
            throttle,
            client,
            records,
            call_timeout: DEFAULT_OUTBOUND_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Wait for a throttle tick, then call the generative service under
    /// `call_timeout`. `abort` cuts both the wait and the call short.
    pub async fn complete(
        &self,
        prompt: &Prompt,
        abort: &CancellationToken,
    ) -> Result<String, PipelineError> {
        self.throttle.wait(abort).await?;
        tokio::select! {
            _ = abort.cancelled() => Err(PipelineError::Cancelled),
            reply = tokio::time::timeout(self.call_timeout, self.client.complete(prompt)) => {
                match reply {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(GenerativeError::Timeout.into()),
                }
            }
        }
    }
}

pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    handlers: Arc<HandlerRegistry>,
    backoff: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue>, handlers: HandlerRegistry) -> Self {
        Self {
            queue,
            handlers: Arc::new(handlers),
            backoff: DEFAULT_DEQUEUE_BACKOFF,
        }
    }

    /// Pause after a failed dequeue before trying again.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawn `concurrency` worker loops. Must be called inside a tokio runtime.
    pub fn start(&self, concurrency: usize) -> PoolHandle {
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();

        let workers = (0..concurrency)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&self.queue),
                    handlers: Arc::clone(&self.handlers),
                    backoff: self.backoff,
                };
                tokio::spawn(worker.run(stop.clone(), abort.clone()))
            })
            .collect();

        tracing::info!(concurrency, kinds = ?self.handlers.kinds(), "worker pool started");
        PoolHandle {
            stop,
            abort,
            workers,
        }
    }
}

/// Owns the running loops. Dropping it leaves them running; call
/// [`PoolHandle::shutdown`] to stop them.
pub struct PoolHandle {
    stop: CancellationToken,
    abort: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new tasks and wait up to `grace` for in-flight ones to
    /// finish. Anything still running after that is aborted: its throttle
    /// wait or outbound call returns early and the task is marked Failed.
    pub async fn shutdown(self, grace: Duration) {
        tracing::info!(?grace, "worker pool shutting down");
        self.stop.cancel();

        let all = join_all(self.workers);
        tokio::pin!(all);
        let within_grace = tokio::time::timeout(grace, &mut all).await;
        let results = match within_grace {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!("grace period elapsed, aborting in-flight tasks");
                self.abort.cancel();
                all.await
            }
        };

        for result in results {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker exited abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: Arc<WorkQueue>,
    handlers: Arc<HandlerRegistry>,
    backoff: Duration,
}

impl Worker {
    async fn run(self, stop: CancellationToken, abort: CancellationToken) {
        tracing::debug!(worker = self.id, "worker started");
        loop {
            let task = match self.queue.dequeue(&stop).await {
                Ok(task) => task,
                Err(PipelineError::Cancelled) => break,
                Err(PipelineError::Malformed(reason)) => {
                    tracing::warn!(worker = self.id, %reason, "dropping malformed queue message");
                    continue;
                }
                Err(PipelineError::Undecodable {
                    task_id,
                    unknown_kind,
                    reason,
                }) => {
                    self.reject(&task_id, unknown_kind, &reason).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, backoff = ?self.backoff, "dequeue failed");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                    continue;
                }
            };
            self.process(task, &abort).await;
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    async fn reject(&self, task_id: &str, unknown_kind: bool, reason: &str) {
        tracing::warn!(worker = self.id, task = %task_id, %reason, "failing undecodable task");
        let message = if unknown_kind {
            UNKNOWN_KIND_MESSAGE
        } else {
            INVALID_TASK_MESSAGE
        };
        if let Err(e) = self
            .queue
            .update_status(task_id, TaskState::Failed, None, Some(message.to_string()))
            .await
        {
            tracing::error!(worker = self.id, task = %task_id, error = %e, "could not record task outcome");
        }
    }

    async fn process(&self, task: Task, abort: &CancellationToken) {
        tracing::info!(worker = self.id, task = %task.id, kind = %task.kind, "processing task");

        if let Err(e) = self
            .queue
            .update_status(&task.id, TaskState::Processing, None, None)
            .await
        {
            tracing::warn!(worker = self.id, task = %task.id, error = %e, "could not mark task processing");
        }

        let outcome = match self.handlers.get(task.kind) {
            Some(handler) => handler.handle(&task, abort).await,
            None => Err(anyhow!(UNKNOWN_KIND_MESSAGE)),
        };

        let recorded = match outcome {
            Ok(result) => {
                tracing::info!(worker = self.id, task = %task.id, "task completed");
                self.queue
                    .update_status(&task.id, TaskState::Completed, Some(result), None)
                    .await
            }
            Err(e) => {
                let message = failure_message(&e);
                tracing::warn!(worker = self.id, task = %task.id, error = %format_args!("{e:#}"), "task failed");
                self.queue
                    .update_status(&task.id, TaskState::Failed, None, Some(message))
                    .await
            }
        };

        if let Err(e) = recorded {
            tracing::error!(worker = self.id, task = %task.id, error = %e, "could not record task outcome");
        }
    }
}

/// The part of a handler error that is safe to show a submitter.
fn failure_message(e: &anyhow::Error) -> String {
    let cancelled = e
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<PipelineError>(), Some(PipelineError::Cancelled)));
    if cancelled {
        SHUTDOWN_MESSAGE.to_string()
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::Context;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn kind(&self) -> TaskKind {
            TaskKind::Divination
        }

        async fn handle(&self, task: &Task, _abort: &CancellationToken) -> anyhow::Result<Value> {
            Ok(serde_json::json!({ "echo": task.id }))
        }
    }

    #[test]
    fn registry_keys_by_handler_kind() {
        let registry = HandlerRegistry::new().with(Arc::new(Echo));
        assert!(registry.get(TaskKind::Divination).is_some());
        assert!(registry.get(TaskKind::Compatibility).is_none());
    }

    #[test]
    fn failure_message_is_outermost_context() {
        let err = Err::<(), _>(anyhow!("connection reset by peer at 10.0.0.3"))
            .context("generative service call failed")
            .unwrap_err();
        assert_eq!(failure_message(&err), "generative service call failed");
    }

    #[test]
    fn cancellation_anywhere_in_chain_reads_as_shutdown() {
        let err = Err::<(), _>(PipelineError::Cancelled)
            .context("generative service call failed")
            .unwrap_err();
        assert_eq!(failure_message(&err), SHUTDOWN_MESSAGE);
    }

    #[tokio::test]
    async fn start_spawns_requested_workers_and_shuts_down() {
        let queue = Arc::new(WorkQueue::new(Arc::new(MemoryStore::new())));
        let pool = WorkerPool::new(queue, HandlerRegistry::new().with(Arc::new(Echo)));
        let handle = pool.start(4);
        assert_eq!(handle.worker_count(), 4);
        handle.shutdown(Duration::from_secs(1)).await;
    }
}
