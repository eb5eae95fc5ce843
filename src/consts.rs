//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

/// List holding queued tasks. Producers push on one end, workers pop the other.
pub const TASK_QUEUE_KEY: &str = "task_queue";

/// Prefix for per-task status entries (`task:status:<id>`).
pub const TASK_STATUS_PREFIX: &str = "task:status";

/// Shared in-flight counter used by the admission gate.
pub const ADMISSION_COUNTER_KEY: &str = "global_concurrency_limit";

/// Prefix for per-caller daily quota counters.
pub const QUOTA_PREFIX: &str = "quota";

/// How long a task status survives after its last write.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(10 * 60);

/// Safety expiry on the admission counter so a crashed holder can't pin it.
pub const DEFAULT_COUNTER_TTL: Duration = Duration::from_secs(5 * 60);

/// Deadline for releasing an admission slot, independent of the request.
pub const DEFAULT_RELEASE_DEADLINE: Duration = Duration::from_secs(5);

/// Upper bound on a single generative-service call.
pub const DEFAULT_OUTBOUND_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause before a worker retries after the queue backend failed.
pub const DEFAULT_DEQUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// How long one blocking pop waits before the worker re-checks for shutdown.
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra spacing added to every throttle tick.
pub const THROTTLE_MARGIN: Duration = Duration::from_millis(10);

/// Model requested from the chat completions endpoint when none is configured.
pub const DEFAULT_MODEL: &str = "ernie-4.0-8k";

pub const DEFAULT_WORKERS: usize = 30;
pub const DEFAULT_RATE_PER_SEC: u32 = 3;
pub const DEFAULT_MAX_CONCURRENCY: u32 = 100;
pub const DEFAULT_DAILY_QUOTA: u32 = 10;
pub const DEFAULT_MAX_TEXT_CHARS: usize = 500;

/// Beijing time; the symbolic engine reads the local calendar.
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 8;

/// Default database path: `~/.fromheart/fromheart.db`.
/// Single DB for the task store and the reading records.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fromheart")
        .join("fromheart.db")
}

/// Key of the status entry for a task id.
pub fn status_key(task_id: &str) -> String {
    format!("{TASK_STATUS_PREFIX}:{task_id}")
}
