//! Error taxonomy shared by the producer, queue and admission gate.

use thiserror::Error;

use crate::generative::GenerativeError;
use crate::store::StoreError;

/// Everything the pipeline can report back to a caller or a worker loop.
///
/// `Validation`, `CapacityExceeded` and `QuotaExceeded` are returned before a
/// task id exists. `Upstream` never reaches a submitter: it ends up as the
/// message of a Failed status.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("server busy, please retry shortly")]
    CapacityExceeded,

    #[error("daily limit of {limit} requests reached")]
    QuotaExceeded { limit: u32 },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] StoreError),

    #[error("upstream failure: {0}")]
    Upstream(#[from] GenerativeError),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A queue message that could not be decoded at all. Dropped by the worker.
    #[error("malformed queue message: {0}")]
    Malformed(String),

    /// A queue message whose task id was readable but whose body was not.
    /// The worker fails the task instead of dropping it.
    #[error("undecodable task {task_id}: {reason}")]
    Undecodable {
        task_id: String,
        unknown_kind: bool,
        reason: String,
    },
}

impl PipelineError {
    /// True for errors a caller can fix by retrying later, unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded | Self::BackendUnavailable(_) | Self::Upstream(_)
        )
    }
}
