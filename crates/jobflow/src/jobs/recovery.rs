use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::FlowResult;
use crate::jobs::model::{Job, ReprocessOutcome, ResumeOutcome};
use crate::jobs::store::JobStore;

/// Operator recovery actions. Each is a single guarded store update, so repeating a call
/// (or racing two of them) is safe. Re-entering the dispatcher is the caller's job; see
/// `JobManager`.
#[derive(Clone)]
pub struct Recovery {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl Recovery {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// STUCK -> IN_PROGRESS while resumes remain, else STUCK -> ERROR.
    /// IN_PROGRESS is a no-op continuation.
    pub async fn resume(&self, job_id: Uuid) -> FlowResult<ResumeOutcome> {
        let outcome = self.store.resume_job(job_id, self.clock.now()).await?;
        let job = outcome.job();
        match &outcome {
            ResumeOutcome::Resumed { .. } => info!(
                job_id = %job_id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                processed = job.processed_count(),
                total = job.total_items,
                "job resumed"
            ),
            ResumeOutcome::Continued { .. } => {
                info!(job_id = %job_id, "resume on a running job; continuing")
            }
            ResumeOutcome::Exhausted { .. } => info!(
                job_id = %job_id,
                retry_count = job.retry_count,
                "resume budget exhausted; job moved to ERROR"
            ),
        }
        Ok(outcome)
    }

    /// Resets ERROR items to PENDING with a fresh attempt budget. DONE items are untouched.
    pub async fn reprocess_errors(&self, job_id: Uuid) -> FlowResult<ReprocessOutcome> {
        let outcome = self
            .store
            .reset_errored_items(job_id, self.clock.now())
            .await?;
        info!(
            job_id = %job_id,
            reset = outcome.reset,
            reprocess_count = outcome.job.reprocess_count,
            max_reprocess_cycles = outcome.job.max_reprocess_cycles,
            "reprocess errors"
        );
        Ok(outcome)
    }

    /// Stops new items from starting; in-flight items finish and the dispatcher drains.
    pub async fn cancel(&self, job_id: Uuid) -> FlowResult<Job> {
        let job = self.store.cancel_job(job_id, self.clock.now()).await?;
        info!(
            job_id = %job_id,
            draining = job.finished_at.is_none(),
            "job cancelled"
        );
        Ok(job)
    }

    pub async fn archive(&self, job_id: Uuid) -> FlowResult<Job> {
        let job = self.store.archive_job(job_id, self.clock.now()).await?;
        info!(job_id = %job_id, status = %job.status, "job archived");
        Ok(job)
    }
}
