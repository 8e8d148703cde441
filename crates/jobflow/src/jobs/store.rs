use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::FlowResult;
use crate::jobs::model::{
    CompleteAck, HeartbeatAck, ItemCompletion, ItemFailure, ItemReport, ItemStatus, Job,
    JobErrorKind, JobFilter, JobOutcome, JobStatus, NewJob, ReprocessOutcome, ResumeOutcome,
    WorkItem, Worker,
};

/// Persistent, transactional home of Job, WorkItem and Worker records.
///
/// Every mutating method is one atomic conditional update: it either applies completely
/// (item transition, job counters and heartbeat together) or not at all. Methods that
/// return `Option` yield `None` when their guard did not match; that is a normal outcome,
/// not an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new_job: NewJob, now: DateTime<Utc>) -> FlowResult<Job>;

    async fn get_job(&self, job_id: Uuid) -> FlowResult<Option<Job>>;

    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> FlowResult<Vec<Job>>;

    /// Ordered by `seq`.
    async fn list_items(&self, job_id: Uuid, status: Option<ItemStatus>)
        -> FlowResult<Vec<WorkItem>>;

    async fn count_by_status(&self) -> FlowResult<Vec<(JobStatus, i64)>>;

    // ---- in-process dispatch ----

    /// PENDING -> IN_PROGRESS.
    async fn start_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job>;

    /// PENDING items that still have attempts left, ordered by `seq`.
    async fn claimable_items(&self, job_id: Uuid, limit: usize) -> FlowResult<Vec<WorkItem>>;

    /// PENDING -> IN_PROGRESS for one item, counting the attempt. Only succeeds while
    /// the owning job is IN_PROGRESS.
    async fn claim_item(&self, item_id: Uuid, now: DateTime<Utc>) -> FlowResult<Option<WorkItem>>;

    /// IN_PROGRESS -> DONE, plus job progress and heartbeat. `attempt` is the attempt
    /// number returned by `claim_item`; a result from any other attempt is discarded.
    async fn complete_item(
        &self,
        item_id: Uuid,
        attempt: i32,
        completion: &ItemCompletion,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<(WorkItem, Job)>>;

    /// IN_PROGRESS -> PENDING (retry) or ERROR, plus job progress and heartbeat.
    /// Same attempt guard as `complete_item`.
    async fn fail_item(
        &self,
        item_id: Uuid,
        attempt: i32,
        failure: &ItemFailure,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<(WorkItem, Job)>>;

    /// Moves an IN_PROGRESS job whose items are all terminal to its final status, and
    /// stamps `finished_at` on a drained CANCELLED job. Otherwise returns the job as is.
    async fn finalize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job>;

    /// IN_PROGRESS -> ERROR after an infrastructure failure.
    async fn fail_job(&self, job_id: Uuid, kind: JobErrorKind, now: DateTime<Utc>)
        -> FlowResult<Job>;

    // ---- watchdog ----

    /// IN_PROGRESS jobs with `last_heartbeat < cutoff` -> STUCK. In-flight items are
    /// released and the worker claim is dropped in the same update.
    async fn mark_stale_jobs_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FlowResult<Vec<Job>>;

    // ---- recovery ----

    async fn resume_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<ResumeOutcome>;

    async fn reset_errored_items(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> FlowResult<ReprocessOutcome>;

    async fn cancel_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job>;

    /// Soft delete of a terminal job.
    async fn archive_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job>;

    // ---- remote workers ----

    async fn upsert_worker(
        &self,
        worker_id: &str,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<Worker>;

    async fn get_worker(&self, worker_id: &str) -> FlowResult<Option<Worker>>;

    async fn set_worker_active(&self, worker_id: &str, active: bool) -> FlowResult<Worker>;

    /// Leases one pull-topology job to `worker_id`, or `None` when nothing is claimable.
    async fn claim_job(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<Job>>;

    async fn heartbeat_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reports: &[ItemReport],
        lease: Duration,
        now: DateTime<Utc>,
    ) -> FlowResult<HeartbeatAck>;

    async fn complete_claimed_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> FlowResult<CompleteAck>;
}
