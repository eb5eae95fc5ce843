//! The submit side: validate a request, charge the caller's daily quota and
//! enqueue it. Never waits on the generative service.

use chrono::{FixedOffset, Offset, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::consts::{DEFAULT_DAILY_QUOTA, DEFAULT_MAX_TEXT_CHARS, DEFAULT_UTC_OFFSET_HOURS, QUOTA_PREFIX};
use crate::divination::{Clock, SystemClock};
use crate::error::PipelineError;
use crate::queue::{Task, TaskKind, TaskStatus, WorkQueue};
use crate::worker::compatibility::CompatibilityRequest;
use crate::worker::divination::DivinationRequest;

const ANONYMOUS_OWNER: &str = "anonymous";
const ACCEPTED_MESSAGE: &str = "请求已受理，正在推演中...";
const QUOTA_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// What a submitter gets back right away.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub task_id: String,
    /// Rough time until a worker gets to the task: queue depth × throttle period.
    #[serde(rename = "estimated_wait_ms", serialize_with = "as_millis")]
    pub estimated_wait: Duration,
    pub message: String,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

pub struct Producer {
    queue: Arc<WorkQueue>,
    clock: Arc<dyn Clock>,
    throttle_period: Duration,
    daily_quota: u32,
    max_text_chars: usize,
}

impl Producer {
    /// `throttle_period` is the outbound tick spacing, used only for the
    /// wait estimate.
    pub fn new(queue: Arc<WorkQueue>, throttle_period: Duration) -> Self {
        let offset = FixedOffset::east_opt(DEFAULT_UTC_OFFSET_HOURS * 3600)
            .unwrap_or_else(|| Utc.fix());
        Self {
            queue,
            clock: Arc::new(SystemClock::new(offset)),
            throttle_period,
            daily_quota: DEFAULT_DAILY_QUOTA,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }

    /// Clock whose local date keys the daily quota.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Requests per caller per kind per day. Zero disables the quota.
    pub fn with_daily_quota(mut self, quota: u32) -> Self {
        self.daily_quota = quota;
        self
    }

    pub fn with_max_text_chars(mut self, max: usize) -> Self {
        self.max_text_chars = max;
        self
    }

    pub async fn submit(
        &self,
        kind: TaskKind,
        payload: Vec<u8>,
        owner_hint: &str,
    ) -> Result<Submission, PipelineError> {
        self.validate(kind, &payload)?;

        let owner = match owner_hint.trim() {
            "" => ANONYMOUS_OWNER,
            owner => owner,
        };
        let quota_key = self.charge_quota(kind, owner).await?;

        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            owner_hint: owner.to_string(),
            submitted_at: Utc::now(),
        };
        if let Err(e) = self.queue.enqueue(&task).await {
            if let Some(key) = quota_key {
                self.refund_quota(&key).await;
            }
            return Err(e);
        }

        let position = match self.queue.backlog().await {
            Ok(n) => n.max(1),
            Err(e) => {
                tracing::debug!(error = %e, "backlog unavailable for wait estimate");
                1
            }
        };
        let estimated_wait = self.throttle_period * u32::try_from(position).unwrap_or(u32::MAX);
        tracing::info!(task = %task.id, %kind, owner, position, "task submitted");

        Ok(Submission {
            task_id: task.id,
            estimated_wait,
            message: ACCEPTED_MESSAGE.to_string(),
        })
    }

    pub async fn submit_divination(
        &self,
        request: &DivinationRequest,
        owner_hint: &str,
    ) -> Result<Submission, PipelineError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| PipelineError::Validation(e.to_string()))?;
        self.submit(TaskKind::Divination, payload, owner_hint).await
    }

    pub async fn submit_compatibility(
        &self,
        request: &CompatibilityRequest,
        owner_hint: &str,
    ) -> Result<Submission, PipelineError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| PipelineError::Validation(e.to_string()))?;
        self.submit(TaskKind::Compatibility, payload, owner_hint).await
    }

    /// Current status of a task. Read-only.
    pub async fn poll(&self, task_id: &str) -> Result<TaskStatus, PipelineError> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(PipelineError::Validation("task id is empty".to_string()));
        }
        self.queue.get_status(task_id).await
    }

    fn validate(&self, kind: TaskKind, payload: &[u8]) -> Result<(), PipelineError> {
        match kind {
            TaskKind::Divination => {
                let request: DivinationRequest = serde_json::from_slice(payload)
                    .map_err(|e| PipelineError::Validation(format!("bad divination request: {e}")))?;
                if request.question.trim().is_empty() {
                    return Err(PipelineError::Validation("question is empty".to_string()));
                }
                self.check_length("question", &request.question)
            }
            TaskKind::Compatibility => {
                let request: CompatibilityRequest = serde_json::from_slice(payload).map_err(|e| {
                    PipelineError::Validation(format!("bad compatibility request: {e}"))
                })?;
                if request.name_a.trim().is_empty() || request.name_b.trim().is_empty() {
                    return Err(PipelineError::Validation("both names are required".to_string()));
                }
                self.check_length("story", &request.story)
            }
        }
    }

    fn check_length(&self, field: &str, text: &str) -> Result<(), PipelineError> {
        let chars = text.chars().count();
        if chars > self.max_text_chars {
            return Err(PipelineError::Validation(format!(
                "{field} is {chars} characters, limit is {}",
                self.max_text_chars
            )));
        }
        Ok(())
    }

    /// Hand back a unit taken by [`Self::charge_quota`]. Best effort.
    async fn refund_quota(&self, key: &str) {
        if let Err(e) = self.queue.store().decrement(key).await {
            tracing::warn!(key, error = %e, "could not return quota slot");
        }
    }

    /// Take one unit of today's quota. Returns the counter key so the unit
    /// can be handed back, or `None` when quotas are off.
    async fn charge_quota(&self, kind: TaskKind, owner: &str) -> Result<Option<String>, PipelineError> {
        if self.daily_quota == 0 {
            return Ok(None);
        }
        let date = self.clock.now().date().format("%Y-%m-%d");
        let key = format!("{QUOTA_PREFIX}:{kind}:{owner}:{date}");
        let store = self.queue.store();

        match store.increment_below(&key, i64::from(self.daily_quota)).await? {
            Some(used) => {
                if used == 1 {
                    if let Err(e) = store.expire(&key, QUOTA_WINDOW).await {
                        self.refund_quota(&key).await;
                        return Err(e.into());
                    }
                }
                Ok(Some(key))
            }
            None => {
                tracing::info!(owner, %kind, limit = self.daily_quota, "daily quota exhausted");
                Err(PipelineError::QuotaExceeded {
                    limit: self.daily_quota,
                })
            }
        }
    }
}
