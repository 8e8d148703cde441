#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    RateLimit,
    DependencyDown,
    BadInput,
    Unprocessable,
    UnknownJobType,
    Abandoned,
    WorkerReported,
    Unknown,
}

impl ErrorCode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "RATE_LIMIT" => Self::RateLimit,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "BAD_INPUT" => Self::BadInput,
            "UNPROCESSABLE" => Self::Unprocessable,
            "UNKNOWN_JOB_TYPE" => Self::UnknownJobType,
            "ABANDONED" => Self::Abandoned,
            "WORKER_REPORTED" => Self::WorkerReported,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::BadInput => "BAD_INPUT",
            Self::Unprocessable => "UNPROCESSABLE",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::Abandoned => "ABANDONED",
            Self::WorkerReported => "WORKER_REPORTED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::from_str(code) {
        ErrorCode::Timeout => {
            "Item exceeded its processor timeout. Check upstream latency or split large inputs, then reprocess."
        }
        ErrorCode::RateLimit => {
            "External API throttled us. Lower JOBFLOW_MAX_CONCURRENCY or wait for quota, then reprocess."
        }
        ErrorCode::DependencyDown => {
            "Upstream service unavailable. Check its health; reprocess once it recovers."
        }
        ErrorCode::BadInput => {
            "Input rejected as malformed. Fix the source document; reprocessing unchanged input will fail again."
        }
        ErrorCode::Unprocessable => {
            "Content could not be handled by the processor. Inspect error_detail; usually not retryable."
        }
        ErrorCode::UnknownJobType => {
            "No processor registered for this job_type. Deploy the processor, then reprocess."
        }
        ErrorCode::Abandoned => {
            "Last attempt was in flight when the job went stale. Reprocess to try again."
        }
        ErrorCode::WorkerReported => {
            "Remote worker reported the run as failed. Check the worker logs before reprocessing."
        }
        ErrorCode::Unknown => {
            "Inspect error_detail and logs. Decide if retryable; add a code mapping once understood."
        }
    }
}
