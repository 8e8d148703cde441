use uuid::Uuid;

use crate::jobs::model::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("work item {0} not found")]
    ItemNotFound(Uuid),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("worker {0} is not authorized")]
    Unauthorized(String),

    #[error("reprocess limit reached after {0} cycle(s)")]
    ReprocessLimit(i32),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FlowError {
    pub fn invalid_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Storage and internal errors are infrastructure failures; everything else is a
    /// caller-visible rejection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Internal(_))
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
