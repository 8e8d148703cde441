use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{FlowError, FlowResult};
use crate::jobs::dispatcher::{DispatchSettings, Dispatcher};
use crate::jobs::error_codes::suggested_action;
use crate::jobs::heartbeat;
use crate::jobs::model::{
    ItemStatus, Job, JobFilter, JobStatus, NewJob, ReprocessOutcome, ResumeOutcome, Topology,
};
use crate::jobs::processor::ProcessorRegistry;
use crate::jobs::recovery::Recovery;
use crate::jobs::store::JobStore;
use crate::jobs::watchdog::{SweepReport, Watchdog};
use crate::jobs::workers::WorkerProtocol;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub dispatch: DispatchSettings,
    pub stuck_threshold: Duration,
    pub lease: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            stuck_threshold: Duration::minutes(5),
            lease: Duration::seconds(60),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dispatch: DispatchSettings {
                max_concurrency: config.max_concurrency,
                ..DispatchSettings::default()
            },
            stuck_threshold: config.stuck_threshold(),
            lease: config.lease(),
        }
    }
}

/// A running in-process dispatch. Dropping it detaches the task; it keeps running.
#[derive(Debug)]
pub struct DispatchHandle {
    job_id: Uuid,
    handle: JoinHandle<FlowResult<Job>>,
}

impl DispatchHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// The job as the dispatcher left it.
    pub async fn wait(self) -> FlowResult<Job> {
        let job_id = self.job_id;
        self.handle
            .await
            .map_err(|e| FlowError::Internal(anyhow::anyhow!("dispatch task for {job_id}: {e}")))?
    }

    /// Kills the dispatch task and every attempt it has in flight, as a process crash would.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: Job,
    pub processed: i32,
    pub heartbeat_age_secs: i64,
    /// Flagged STUCK by the watchdog.
    pub is_stuck: bool,
    /// IN_PROGRESS but past the threshold; the next sweep will flag it.
    pub heartbeat_stale: bool,
    /// STUCK with every item already terminal; a resume only finalizes it.
    pub ready_to_finalize: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorView {
    pub item_id: Uuid,
    pub seq: i32,
    pub input: Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub suggested_action: String,
}

/// Operator and worker surface over one `JobStore`.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    recovery: Recovery,
    watchdog: Watchdog,
    workers: WorkerProtocol,
    clock: Arc<dyn Clock>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        processors: ProcessorRegistry,
        clock: Arc<dyn Clock>,
        settings: ManagerSettings,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(processors),
            clock.clone(),
            settings.dispatch,
        );
        Self {
            recovery: Recovery::new(store.clone(), clock.clone()),
            watchdog: Watchdog::new(store.clone(), clock.clone(), settings.stuck_threshold),
            workers: WorkerProtocol::new(store.clone(), clock.clone(), settings.lease),
            dispatcher,
            store,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn workers(&self) -> &WorkerProtocol {
        &self.workers
    }

    /// Stores the job in PENDING. In-process jobs start dispatching right away; pull jobs
    /// wait for a worker to claim them.
    pub async fn create_job(&self, new_job: NewJob) -> FlowResult<(Job, Option<DispatchHandle>)> {
        let job = self.store.create_job(new_job, self.clock.now()).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            topology = job.topology.as_str(),
            total_items = job.total_items,
            "job created"
        );

        let handle = match job.topology {
            Topology::InProcess => Some(self.dispatch(job.id)),
            Topology::Pull => None,
        };
        Ok((job, handle))
    }

    /// Runs the dispatcher for `job_id` on its own task.
    pub fn dispatch(&self, job_id: Uuid) -> DispatchHandle {
        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move {
            let res = dispatcher.run(job_id).await;
            if let Err(e) = &res {
                error!(job_id = %job_id, error = %e, "dispatch failed");
            }
            res
        });
        DispatchHandle { job_id, handle }
    }

    pub async fn get_status(&self, job_id: Uuid) -> FlowResult<JobStatusView> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(FlowError::JobNotFound(job_id))?;
        Ok(self.status_view(job))
    }

    pub fn status_view(&self, job: Job) -> JobStatusView {
        let now = self.clock.now();
        JobStatusView {
            processed: job.processed_count(),
            heartbeat_age_secs: job.heartbeat_age(now).num_seconds(),
            is_stuck: job.status == JobStatus::Stuck,
            heartbeat_stale: job.status == JobStatus::InProgress
                && heartbeat::is_stale(&job, now, self.watchdog.threshold()),
            ready_to_finalize: job.status == JobStatus::Stuck
                && job.processed_count() == job.total_items,
            job,
        }
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> FlowResult<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    /// ERROR items with the operator hint for each error code.
    pub async fn list_errors(&self, job_id: Uuid) -> FlowResult<Vec<ErrorView>> {
        let items = self.store.list_items(job_id, Some(ItemStatus::Error)).await?;
        Ok(items
            .into_iter()
            .map(|item| {
                let code = item.error_code.clone().unwrap_or_else(|| "UNKNOWN".into());
                ErrorView {
                    item_id: item.id,
                    seq: item.seq,
                    input: item.input,
                    attempts: item.attempts,
                    max_attempts: item.max_attempts,
                    suggested_action: suggested_action(&code).to_string(),
                    error_code: item.error_code,
                    error_detail: item.error_detail,
                    last_error_at: item.last_error_at,
                }
            })
            .collect())
    }

    /// Resumes and, for in-process jobs with work left, re-enters the dispatcher.
    pub async fn resume(&self, job_id: Uuid) -> FlowResult<(ResumeOutcome, Option<DispatchHandle>)> {
        let outcome = self.recovery.resume(job_id).await?;
        let handle = (outcome.should_dispatch()
            && outcome.job().topology == Topology::InProcess)
            .then(|| self.dispatch(job_id));
        Ok((outcome, handle))
    }

    pub async fn reprocess_errors(
        &self,
        job_id: Uuid,
    ) -> FlowResult<(ReprocessOutcome, Option<DispatchHandle>)> {
        let outcome = self.recovery.reprocess_errors(job_id).await?;
        let handle = (outcome.reset > 0 && outcome.job.topology == Topology::InProcess)
            .then(|| self.dispatch(job_id));
        Ok((outcome, handle))
    }

    pub async fn cancel(&self, job_id: Uuid) -> FlowResult<Job> {
        self.recovery.cancel(job_id).await
    }

    pub async fn archive(&self, job_id: Uuid) -> FlowResult<Job> {
        self.recovery.archive(job_id).await
    }

    pub async fn run_watchdog_sweep(&self) -> FlowResult<SweepReport> {
        self.watchdog.sweep().await
    }

    /// Job counts for every status, zero-filled.
    pub async fn job_counts(&self) -> FlowResult<Vec<(JobStatus, i64)>> {
        let counts = self.store.count_by_status().await?;
        Ok(JobStatus::ALL
            .into_iter()
            .map(|status| {
                let n = counts
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map(|(_, n)| *n)
                    .unwrap_or(0);
                (status, n)
            })
            .collect())
    }
}
