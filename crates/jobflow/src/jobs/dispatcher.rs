use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FlowError, FlowResult};
use crate::jobs::model::{ItemStatus, Job, JobErrorKind, JobStatus, Topology, WorkItem};
use crate::jobs::processor::ProcessorRegistry;
use crate::jobs::retry::{next_delay, RetryConfig};
use crate::jobs::state;
use crate::jobs::store::JobStore;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Item attempts in flight at once, per job.
    pub max_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 20,
            retry: RetryConfig::default(),
        }
    }
}

/// Drives one in-process job to completion: fans PENDING items out to the job type's
/// processor, never more than `max_concurrency` at a time.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    processors: Arc<ProcessorRegistry>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

struct Attempt {
    store: Arc<dyn JobStore>,
    processors: Arc<ProcessorRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    job_type: String,
    config: Arc<Value>,
    item: WorkItem,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        processors: Arc<ProcessorRegistry>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            processors,
            clock,
            settings,
        }
    }

    /// Runs the job until no PENDING item is left, then finalizes it.
    ///
    /// Safe to call while another dispatcher works on the same job (e.g. two resumes):
    /// each item attempt starts with a guarded PENDING -> IN_PROGRESS claim, so an item
    /// is never processed by both. Storage errors abort the run and are returned.
    pub async fn run(&self, job_id: Uuid) -> FlowResult<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(FlowError::JobNotFound(job_id))?;

        if job.topology != Topology::InProcess {
            return Err(FlowError::Validation(format!(
                "job {job_id} uses the pull topology; remote workers claim it"
            )));
        }

        let job = match job.status {
            JobStatus::Pending => self.store.start_job(job_id, self.clock.now()).await?,
            JobStatus::InProgress => job,
            JobStatus::Cancelled => return self.store.finalize_job(job_id, self.clock.now()).await,
            _ => return Ok(job),
        };

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            total_items = job.total_items,
            processed = job.processed_count(),
            "dispatch started"
        );

        if let Err(e) = self.drive(&job).await {
            error!(job_id = %job_id, error = %e, "dispatch aborted");
            if let Err(mark_err) = self
                .store
                .fail_job(job_id, JobErrorKind::Fatal, self.clock.now())
                .await
            {
                warn!(job_id = %job_id, error = %mark_err, "could not record fatal error on job");
            }
            return Err(e);
        }

        let job = self.store.finalize_job(job_id, self.clock.now()).await?;
        info!(
            job_id = %job.id,
            status = %job.status,
            completed = job.completed_count,
            errors = job.error_count,
            skipped = job.skipped_count,
            "dispatch finished"
        );
        Ok(job)
    }

    async fn drive(&self, job: &Job) -> FlowResult<()> {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let config = Arc::new(job.config.clone());
        let mut tasks: JoinSet<FlowResult<()>> = JoinSet::new();

        let result = async {
            loop {
                let current = self
                    .store
                    .get_job(job.id)
                    .await?
                    .ok_or(FlowError::JobNotFound(job.id))?;
                if current.status != JobStatus::InProgress {
                    debug!(job_id = %job.id, status = %current.status, "job left IN_PROGRESS; no new items");
                    break;
                }

                // wait for a free slot before looking at the queue, so a retried item
                // is picked up again ahead of later ones
                let mut slots = vec![self.acquire(&permits, &mut tasks).await?];
                while let Ok(permit) = permits.clone().try_acquire_owned() {
                    slots.push(permit);
                }

                let batch = self.store.claimable_items(job.id, slots.len()).await?;

                let mut launched = 0usize;
                for item in batch {
                    let Some(permit) = slots.pop() else {
                        break;
                    };

                    // guarded: loses against a concurrent dispatcher or a status change
                    let Some(item) = self.store.claim_item(item.id, self.clock.now()).await? else {
                        slots.push(permit);
                        continue;
                    };
                    debug!(job_id = %job.id, item_id = %item.id, attempt = item.attempts, "item claimed");

                    let attempt = Attempt {
                        store: self.store.clone(),
                        processors: self.processors.clone(),
                        clock: self.clock.clone(),
                        retry: self.settings.retry.clone(),
                        job_type: job.job_type.clone(),
                        config: config.clone(),
                        item,
                    };
                    tasks.spawn(async move {
                        let _permit = permit;
                        attempt.run().await
                    });
                    launched += 1;
                }
                drop(slots);

                if launched == 0 {
                    // nothing new to start: wait for an in-flight attempt, or stop
                    match tasks.join_next().await {
                        Some(joined) => joined_result(joined)?,
                        None => break,
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                joined_result(joined)?;
            }
            Ok::<(), FlowError>(())
        }
        .await;

        if result.is_err() {
            tasks.shutdown().await;
        }
        result
    }

    /// Waits for a free permit by reaping finished attempts, so their errors surface.
    async fn acquire(
        &self,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<FlowResult<()>>,
    ) -> FlowResult<OwnedSemaphorePermit> {
        loop {
            if let Ok(permit) = permits.clone().try_acquire_owned() {
                return Ok(permit);
            }
            match tasks.join_next().await {
                Some(joined) => joined_result(joined)?,
                None => {
                    return permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| FlowError::Internal(e.into()))
                }
            }
        }
    }
}

fn joined_result(joined: Result<FlowResult<()>, tokio::task::JoinError>) -> FlowResult<()> {
    joined.map_err(|e| FlowError::Internal(anyhow::anyhow!("item attempt task failed: {e}")))?
}

impl Attempt {
    async fn run(self) -> FlowResult<()> {
        let item_id = self.item.id;
        let job_id = self.item.job_id;
        let attempt = self.item.attempts;

        match self
            .processors
            .run(&self.job_type, &self.item, &self.config)
            .await
        {
            Ok(completion) => {
                match self
                    .store
                    .complete_item(item_id, attempt, &completion, self.clock.now())
                    .await?
                {
                    Some((_, job)) => debug!(
                        job_id = %job_id,
                        item_id = %item_id,
                        processed = job.processed_count(),
                        total = job.total_items,
                        "item done"
                    ),
                    None => warn!(
                        job_id = %job_id,
                        item_id = %item_id,
                        attempt,
                        "attempt no longer holds the item; result discarded"
                    ),
                }
            }
            Err(failure) => {
                let will_retry = state::status_after_failure(&self.item, &failure)
                    == ItemStatus::Pending;
                if will_retry {
                    // item stays IN_PROGRESS through the backoff, so nobody re-claims it early
                    let delay = {
                        let mut rng = StdRng::from_entropy();
                        next_delay(self.item.attempts, &self.retry, &mut rng)
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }

                match self
                    .store
                    .fail_item(item_id, attempt, &failure, self.clock.now())
                    .await?
                {
                    Some((item, _)) => warn!(
                        job_id = %job_id,
                        item_id = %item_id,
                        code = %failure.code,
                        attempt = item.attempts,
                        max_attempts = item.max_attempts,
                        status = item.status.as_str(),
                        error = %failure.message,
                        "item attempt failed"
                    ),
                    None => warn!(
                        job_id = %job_id,
                        item_id = %item_id,
                        attempt,
                        "attempt no longer holds the item; failure discarded"
                    ),
                }
            }
        }
        Ok(())
    }
}
