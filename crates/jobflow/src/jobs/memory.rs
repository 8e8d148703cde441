use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};
use crate::jobs::model::{
    CompleteAck, Directive, HeartbeatAck, ItemCompletion, ItemFailure, ItemReport, ItemStatus,
    Job, JobErrorKind, JobFilter, JobOutcome, JobStatus, NewJob, ReprocessOutcome,
    ResumeOutcome, Topology, WorkItem, Worker,
};
use crate::jobs::store::JobStore;
use crate::jobs::transitions;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    items: HashMap<Uuid, WorkItem>,
    /// Item ids per job, in `seq` order.
    job_items: HashMap<Uuid, Vec<Uuid>>,
    workers: HashMap<String, Worker>,
}

impl Tables {
    fn job(&self, job_id: Uuid) -> FlowResult<&Job> {
        self.jobs.get(&job_id).ok_or(FlowError::JobNotFound(job_id))
    }

    fn job_mut(&mut self, job_id: Uuid) -> FlowResult<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(FlowError::JobNotFound(job_id))
    }

    fn items_of(&self, job_id: Uuid) -> impl Iterator<Item = &WorkItem> + '_ {
        self.job_items
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
    }

    fn any_in_flight(&self, job_id: Uuid) -> bool {
        self.items_of(job_id)
            .any(|item| item.status == ItemStatus::InProgress)
    }

    /// The job plus mutable access to those of its items matching `pred`.
    fn job_with_items(
        &mut self,
        job_id: Uuid,
        pred: impl Fn(&WorkItem) -> bool,
    ) -> FlowResult<(&mut Job, Vec<&mut WorkItem>)> {
        let Tables { jobs, items, .. } = self;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(FlowError::JobNotFound(job_id))?;
        let mut matching: Vec<&mut WorkItem> = items
            .values_mut()
            .filter(|item| item.job_id == job_id && pred(item))
            .collect();
        matching.sort_by_key(|item| item.seq);
        Ok((job, matching))
    }

    /// An IN_PROGRESS item together with its job; `None` when the item is not in flight
    /// under `attempt`.
    fn in_flight_item(
        &mut self,
        item_id: Uuid,
        attempt: i32,
    ) -> FlowResult<Option<(&mut Job, &mut WorkItem)>> {
        let Tables { jobs, items, .. } = self;
        let item = items
            .get_mut(&item_id)
            .ok_or(FlowError::ItemNotFound(item_id))?;
        if item.status != ItemStatus::InProgress || item.attempts != attempt {
            return Ok(None);
        }
        let job = jobs
            .get_mut(&item.job_id)
            .ok_or(FlowError::JobNotFound(item.job_id))?;
        Ok(Some((job, item)))
    }
}

/// In-process `JobStore`. Each operation holds the write lock for its whole duration,
/// which gives the same all-or-nothing guarantee as a database transaction.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new_job: NewJob, now: DateTime<Utc>) -> FlowResult<Job> {
        new_job.validate()?;
        let (job, items) = new_job.into_records(Uuid::new_v4(), now);

        let mut t = self.inner.write().await;
        t.job_items
            .insert(job.id, items.iter().map(|item| item.id).collect());
        for item in items {
            t.items.insert(item.id, item);
        }
        t.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> FlowResult<Option<Job>> {
        let t = self.inner.read().await;
        Ok(t.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> FlowResult<Vec<Job>> {
        let t = self.inner.read().await;
        let mut jobs: Vec<Job> = t
            .jobs
            .values()
            .filter(|job| filter.include_archived || job.archived_at.is_none())
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(filter.clamped_limit() as usize);
        Ok(jobs)
    }

    async fn list_items(
        &self,
        job_id: Uuid,
        status: Option<ItemStatus>,
    ) -> FlowResult<Vec<WorkItem>> {
        let t = self.inner.read().await;
        t.job(job_id)?;
        Ok(t
            .items_of(job_id)
            .filter(|item| status.map_or(true, |s| item.status == s))
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> FlowResult<Vec<(JobStatus, i64)>> {
        let t = self.inner.read().await;
        Ok(JobStatus::ALL
            .into_iter()
            .map(|status| {
                let n = t.jobs.values().filter(|job| job.status == status).count();
                (status, n as i64)
            })
            .collect())
    }

    async fn start_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut t = self.inner.write().await;
        let job = t.job_mut(job_id)?;
        transitions::start(job, now)?;
        Ok(job.clone())
    }

    async fn claimable_items(&self, job_id: Uuid, limit: usize) -> FlowResult<Vec<WorkItem>> {
        let t = self.inner.read().await;
        Ok(t
            .items_of(job_id)
            .filter(|item| item.status == ItemStatus::Pending && item.can_attempt())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_item(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<WorkItem>> {
        let mut t = self.inner.write().await;
        let Tables { jobs, items, .. } = &mut *t;

        let item = items
            .get_mut(&item_id)
            .ok_or(FlowError::ItemNotFound(item_id))?;
        let job_running = jobs
            .get(&item.job_id)
            .is_some_and(|job| job.status == JobStatus::InProgress);
        if !job_running || item.status != ItemStatus::Pending || !item.can_attempt() {
            return Ok(None);
        }

        transitions::claim_item(item, now);
        Ok(Some(item.clone()))
    }

    async fn complete_item(
        &self,
        item_id: Uuid,
        attempt: i32,
        completion: &ItemCompletion,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<(WorkItem, Job)>> {
        let mut t = self.inner.write().await;
        let Some((job, item)) = t.in_flight_item(item_id, attempt)? else {
            return Ok(None);
        };
        transitions::complete_item(job, item, completion, now);
        Ok(Some((item.clone(), job.clone())))
    }

    async fn fail_item(
        &self,
        item_id: Uuid,
        attempt: i32,
        failure: &ItemFailure,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<(WorkItem, Job)>> {
        let mut t = self.inner.write().await;
        let Some((job, item)) = t.in_flight_item(item_id, attempt)? else {
            return Ok(None);
        };
        transitions::fail_item(job, item, failure, now);
        Ok(Some((item.clone(), job.clone())))
    }

    async fn finalize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut t = self.inner.write().await;
        let in_flight = t.any_in_flight(job_id);
        let job = t.job_mut(job_id)?;
        transitions::finalize(job, in_flight, now)?;
        Ok(job.clone())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        kind: JobErrorKind,
        now: DateTime<Utc>,
    ) -> FlowResult<Job> {
        let mut t = self.inner.write().await;
        let job = t.job_mut(job_id)?;
        transitions::fail_job(job, kind, now)?;
        Ok(job.clone())
    }

    async fn mark_stale_jobs_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FlowResult<Vec<Job>> {
        let mut t = self.inner.write().await;
        let stale: Vec<Uuid> = t
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::InProgress && job.last_heartbeat < cutoff)
            .map(|job| job.id)
            .collect();

        let mut flagged = Vec::with_capacity(stale.len());
        for job_id in stale {
            let (job, in_flight) =
                t.job_with_items(job_id, |item| item.status == ItemStatus::InProgress)?;
            transitions::mark_stuck(job, in_flight, now)?;
            flagged.push(job.clone());
        }
        Ok(flagged)
    }

    async fn resume_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<ResumeOutcome> {
        let mut t = self.inner.write().await;
        transitions::resume(t.job_mut(job_id)?, now)
    }

    async fn reset_errored_items(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> FlowResult<ReprocessOutcome> {
        let mut t = self.inner.write().await;
        let (job, errored) = t.job_with_items(job_id, |item| item.status == ItemStatus::Error)?;
        transitions::reset_errored(job, errored, now)
    }

    async fn cancel_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut t = self.inner.write().await;
        let in_flight = t.any_in_flight(job_id);
        let job = t.job_mut(job_id)?;
        transitions::cancel(job, in_flight, now)?;
        Ok(job.clone())
    }

    async fn archive_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut t = self.inner.write().await;
        let job = t.job_mut(job_id)?;
        transitions::archive(job, now)?;
        Ok(job.clone())
    }

    async fn upsert_worker(
        &self,
        worker_id: &str,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<Worker> {
        let mut t = self.inner.write().await;
        let worker = t
            .workers
            .entry(worker_id.to_string())
            .and_modify(|w| {
                w.credential_hash = credential_hash.to_string();
                w.active = true;
            })
            .or_insert_with(|| Worker {
                id: worker_id.to_string(),
                credential_hash: credential_hash.to_string(),
                last_heartbeat: None,
                active: true,
                registered_at: now,
            });
        Ok(worker.clone())
    }

    async fn get_worker(&self, worker_id: &str) -> FlowResult<Option<Worker>> {
        let t = self.inner.read().await;
        Ok(t.workers.get(worker_id).cloned())
    }

    async fn set_worker_active(&self, worker_id: &str, active: bool) -> FlowResult<Worker> {
        let mut t = self.inner.write().await;
        let worker = t
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| FlowError::WorkerNotFound(worker_id.to_string()))?;
        worker.active = active;
        Ok(worker.clone())
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<Job>> {
        let mut t = self.inner.write().await;

        let held = t
            .jobs
            .values()
            .find(|job| {
                job.status == JobStatus::InProgress
                    && job.archived_at.is_none()
                    && job.is_claimed_by(worker_id)
            })
            .map(|job| job.id);

        let candidate = held.or_else(|| {
            t.jobs
                .values()
                .filter(|job| {
                    job.topology == Topology::Pull
                        && job.archived_at.is_none()
                        && (job.status == JobStatus::Pending
                            || (job.status == JobStatus::InProgress && job.claimed_by.is_none()))
                })
                .min_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|job| job.id)
        });

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        if let Some(worker) = t.workers.get_mut(worker_id) {
            worker.last_heartbeat = Some(now);
        }
        let job = t.job_mut(job_id)?;
        transitions::claim_job(job, worker_id, lease, now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reports: &[ItemReport],
        lease: Duration,
        now: DateTime<Utc>,
    ) -> FlowResult<HeartbeatAck> {
        let mut t = self.inner.write().await;
        let job = t.job(job_id)?;
        if !transitions::accepts_heartbeat(job, worker_id) {
            return Ok(HeartbeatAck {
                job: job.clone(),
                directive: Directive::Stop,
                applied: 0,
            });
        }

        let mut applied = 0;
        {
            let Tables { jobs, items, .. } = &mut *t;
            let job = jobs
                .get_mut(&job_id)
                .ok_or(FlowError::JobNotFound(job_id))?;
            for report in reports {
                if let Some(item) = items.get_mut(&report.item_id) {
                    if transitions::report_item(job, item, &report.outcome, now) {
                        applied += 1;
                    }
                }
            }
        }

        if let Some(worker) = t.workers.get_mut(worker_id) {
            worker.last_heartbeat = Some(now);
        }
        let job = t.job_mut(job_id)?;
        let directive = transitions::heartbeat(job, lease, now);
        Ok(HeartbeatAck {
            job: job.clone(),
            directive,
            applied,
        })
    }

    async fn complete_claimed_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> FlowResult<CompleteAck> {
        let mut t = self.inner.write().await;
        let job = t.job(job_id)?;

        if !job.is_claimed_by(worker_id) {
            return Ok(CompleteAck {
                accepted: false,
                job: job.clone(),
            });
        }
        if job.status != JobStatus::InProgress {
            let job = t.job_mut(job_id)?;
            transitions::release_cancelled(job, now);
            return Ok(CompleteAck {
                accepted: false,
                job: job.clone(),
            });
        }

        let (job, remaining) = t.job_with_items(job_id, |item| !item.status.is_terminal())?;
        transitions::complete_claimed(job, remaining, outcome, now)?;
        Ok(CompleteAck {
            accepted: true,
            job: job.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::jobs::model::{ItemStatus, Job, JobStatus, Topology, WorkItem};

    pub fn sample_job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: "classify_document".into(),
            topology: Topology::InProcess,
            status,
            config: json!({}),
            priority: 0,
            total_items: 3,
            completed_count: 0,
            error_count: 0,
            skipped_count: 0,
            last_heartbeat: now,
            last_item_processed: None,
            retry_count: 0,
            max_retries: 3,
            reprocess_count: 0,
            max_reprocess_cycles: 3,
            partial_failure_is_error: true,
            error_kind: None,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            archived_at: None,
        }
    }

    pub fn sample_item() -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            seq: 0,
            input: json!({ "document": "lease.pdf" }),
            status: ItemStatus::InProgress,
            attempts: 1,
            max_attempts: 3,
            output: None,
            skip_reason: None,
            error_code: None,
            error_detail: None,
            last_error_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}
