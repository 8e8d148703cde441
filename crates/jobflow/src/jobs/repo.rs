// crates/jobflow/src/jobs/repo.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};
use crate::jobs::model::{
    CompleteAck, Directive, HeartbeatAck, ItemCompletion, ItemFailure, ItemReport, ItemStatus,
    Job, JobErrorKind, JobFilter, JobOutcome, JobStatus, NewJob, ReprocessOutcome,
    ResumeOutcome, Topology, WorkItem, Worker,
};
use crate::jobs::store::JobStore;
use crate::jobs::transitions;

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    topology: String,
    status: String,
    config: Value,
    priority: i32,
    total_items: i32,
    completed_count: i32,
    error_count: i32,
    skipped_count: i32,
    last_heartbeat: DateTime<Utc>,
    last_item_processed: Option<String>,
    retry_count: i32,
    max_retries: i32,
    reprocess_count: i32,
    max_reprocess_cycles: i32,
    partial_failure_is_error: bool,
    error_kind: Option<String>,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

fn unknown(column: &str, value: &str) -> FlowError {
    FlowError::Internal(anyhow::anyhow!("unknown {column} value in database: {value}"))
}

impl TryFrom<JobRow> for Job {
    type Error = FlowError;

    fn try_from(row: JobRow) -> FlowResult<Self> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| unknown("status", &row.status))?;
        let topology =
            Topology::parse(&row.topology).ok_or_else(|| unknown("topology", &row.topology))?;
        let error_kind = match row.error_kind.as_deref() {
            Some(s) => Some(JobErrorKind::parse(s).ok_or_else(|| unknown("error_kind", s))?),
            None => None,
        };

        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            topology,
            status,
            config: row.config,
            priority: row.priority,
            total_items: row.total_items,
            completed_count: row.completed_count,
            error_count: row.error_count,
            skipped_count: row.skipped_count,
            last_heartbeat: row.last_heartbeat,
            last_item_processed: row.last_item_processed,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            reprocess_count: row.reprocess_count,
            max_reprocess_cycles: row.max_reprocess_cycles,
            partial_failure_is_error: row.partial_failure_is_error,
            error_kind,
            claimed_by: row.claimed_by,
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
            archived_at: row.archived_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    job_id: Uuid,
    seq: i32,
    input: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    output: Option<Value>,
    skip_reason: Option<String>,
    error_code: Option<String>,
    error_detail: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<ItemRow> for WorkItem {
    type Error = FlowError;

    fn try_from(row: ItemRow) -> FlowResult<Self> {
        let status =
            ItemStatus::parse(&row.status).ok_or_else(|| unknown("item status", &row.status))?;
        Ok(WorkItem {
            id: row.id,
            job_id: row.job_id,
            seq: row.seq,
            input: row.input,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            output: row.output,
            skip_reason: row.skip_reason,
            error_code: row.error_code,
            error_detail: row.error_detail,
            last_error_at: row.last_error_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn jobs_from(rows: Vec<JobRow>) -> FlowResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

fn items_from(rows: Vec<ItemRow>) -> FlowResult<Vec<WorkItem>> {
    rows.into_iter().map(WorkItem::try_from).collect()
}

// ----------------------------
// Row-level helpers (run inside a transaction)
// ----------------------------

async fn lock_job(conn: &mut PgConnection, job_id: Uuid) -> FlowResult<Job> {
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(conn)
        .await?;
    row.ok_or(FlowError::JobNotFound(job_id))?.try_into()
}

/// Locks the job's items whose status is one of `statuses`, in `seq` order.
async fn lock_items(
    conn: &mut PgConnection,
    job_id: Uuid,
    statuses: &[ItemStatus],
) -> FlowResult<Vec<WorkItem>> {
    let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    let rows = sqlx::query_as::<_, ItemRow>(
        r#"
        SELECT *
        FROM work_items
        WHERE job_id = $1
          AND status = ANY($2)
        ORDER BY seq
        FOR UPDATE
        "#,
    )
    .bind(job_id)
    .bind(statuses)
    .fetch_all(conn)
    .await?;
    items_from(rows)
}

async fn any_in_flight(conn: &mut PgConnection, job_id: Uuid) -> FlowResult<bool> {
    let in_flight: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM work_items WHERE job_id = $1 AND status = 'in_progress')",
    )
    .bind(job_id)
    .fetch_one(conn)
    .await?;
    Ok(in_flight)
}

async fn item_owner(conn: &mut PgConnection, item_id: Uuid) -> FlowResult<Uuid> {
    let job_id: Option<Uuid> = sqlx::query_scalar("SELECT job_id FROM work_items WHERE id = $1")
        .bind(item_id)
        .fetch_optional(conn)
        .await?;
    job_id.ok_or(FlowError::ItemNotFound(item_id))
}

async fn write_job(conn: &mut PgConnection, job: &Job) -> FlowResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            completed_count = $3,
            error_count = $4,
            skipped_count = $5,
            last_heartbeat = $6,
            last_item_processed = $7,
            retry_count = $8,
            reprocess_count = $9,
            error_kind = $10,
            claimed_by = $11,
            claim_expires_at = $12,
            updated_at = $13,
            finished_at = $14,
            archived_at = $15
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(job.completed_count)
    .bind(job.error_count)
    .bind(job.skipped_count)
    .bind(job.last_heartbeat)
    .bind(job.last_item_processed.as_deref())
    .bind(job.retry_count)
    .bind(job.reprocess_count)
    .bind(job.error_kind.map(|k| k.as_str()))
    .bind(job.claimed_by.as_deref())
    .bind(job.claim_expires_at)
    .bind(job.updated_at)
    .bind(job.finished_at)
    .bind(job.archived_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_item(conn: &mut PgConnection, item: &WorkItem) -> FlowResult<()> {
    sqlx::query(
        r#"
        UPDATE work_items
        SET status = $2,
            attempts = $3,
            output = $4,
            skip_reason = $5,
            error_code = $6,
            error_detail = $7,
            last_error_at = $8,
            started_at = $9,
            finished_at = $10
        WHERE id = $1
        "#,
    )
    .bind(item.id)
    .bind(item.status.as_str())
    .bind(item.attempts)
    .bind(item.output.as_ref())
    .bind(item.skip_reason.as_deref())
    .bind(item.error_code.as_deref())
    .bind(item.error_detail.as_deref())
    .bind(item.last_error_at)
    .bind(item.started_at)
    .bind(item.finished_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn write_items(conn: &mut PgConnection, items: &[WorkItem]) -> FlowResult<()> {
    for item in items {
        write_item(&mut *conn, item).await?;
    }
    Ok(())
}

async fn touch_worker(conn: &mut PgConnection, worker_id: &str, now: DateTime<Utc>) -> FlowResult<()> {
    sqlx::query("UPDATE workers SET last_heartbeat = $2 WHERE id = $1")
        .bind(worker_id)
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

/// Postgres-backed `JobStore`. Every mutation locks the job row (`FOR UPDATE`) before
/// touching its items, so concurrent writers always take locks in job -> item order.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// In-process jobs left PENDING or IN_PROGRESS, e.g. after a server restart.
    pub async fn unfinished_in_process_jobs(&self) -> FlowResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE topology = 'in_process'
              AND status IN ('pending', 'in_progress')
              AND archived_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        jobs_from(rows)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, new_job: NewJob, now: DateTime<Utc>) -> FlowResult<Job> {
        new_job.validate()?;
        let (job, items) = new_job.into_records(Uuid::new_v4(), now);

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, job_type, topology, status, config, priority,
                total_items, last_heartbeat,
                max_retries, max_reprocess_cycles, partial_failure_is_error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $8, $8)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.topology.as_str())
        .bind(job.status.as_str())
        .bind(&job.config)
        .bind(job.priority)
        .bind(job.total_items)
        .bind(now)
        .bind(job.max_retries)
        .bind(job.max_reprocess_cycles)
        .bind(job.partial_failure_is_error)
        .fetch_one(&mut *tx)
        .await?;

        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO work_items (id, job_id, seq, input, status, attempts, max_attempts)
                VALUES ($1, $2, $3, $4, 'pending', 0, $5)
                "#,
            )
            .bind(item.id)
            .bind(item.job_id)
            .bind(item.seq)
            .bind(&item.input)
            .bind(item.max_attempts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        row.try_into()
    }

    async fn get_job(&self, job_id: Uuid) -> FlowResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> FlowResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2 OR archived_at IS NULL)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.include_archived)
        .bind(filter.clamped_limit())
        .fetch_all(&self.pool)
        .await?;
        jobs_from(rows)
    }

    async fn list_items(
        &self,
        job_id: Uuid,
        status: Option<ItemStatus>,
    ) -> FlowResult<Vec<WorkItem>> {
        if self.get_job(job_id).await?.is_none() {
            return Err(FlowError::JobNotFound(job_id));
        }
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT *
            FROM work_items
            WHERE job_id = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY seq
            "#,
        )
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        items_from(rows)
    }

    async fn count_by_status(&self) -> FlowResult<Vec<(JobStatus, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let counts: HashMap<String, i64> = rows.into_iter().collect();
        Ok(JobStatus::ALL
            .into_iter()
            .map(|status| (status, counts.get(status.as_str()).copied().unwrap_or(0)))
            .collect())
    }

    async fn start_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        transitions::start(&mut job, now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn claimable_items(&self, job_id: Uuid, limit: usize) -> FlowResult<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT *
            FROM work_items
            WHERE job_id = $1
              AND status = 'pending'
              AND attempts < max_attempts
            ORDER BY seq
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        items_from(rows)
    }

    async fn claim_item(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<WorkItem>> {
        let mut tx = self.pool.begin().await?;
        let job_id = item_owner(&mut tx, item_id).await?;

        // shared lock: cancel/stuck (FOR UPDATE) wait for in-flight claims and vice versa
        let job_status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR SHARE")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        if job_status != JobStatus::InProgress.as_str() {
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            UPDATE work_items
            SET status = 'in_progress',
                attempts = attempts + 1,
                started_at = $2
            WHERE id = $1
              AND status = 'pending'
              AND attempts < max_attempts
            RETURNING *
            "#,
        )
        .bind(item_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn complete_item(
        &self,
        item_id: Uuid,
        attempt: i32,
        completion: &ItemCompletion,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<(WorkItem, Job)>> {
        let mut tx = self.pool.begin().await?;
        let job_id = item_owner(&mut tx, item_id).await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT *
            FROM work_items
            WHERE id = $1
              AND status = 'in_progress'
              AND attempts = $2
            FOR UPDATE
            "#,
        )
        .bind(item_id)
        .bind(attempt)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut item = WorkItem::try_from(row)?;

        transitions::complete_item(&mut job, &mut item, completion, now);
        write_item(&mut tx, &item).await?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some((item, job)))
    }

    async fn fail_item(
        &self,
        item_id: Uuid,
        attempt: i32,
        failure: &ItemFailure,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<(WorkItem, Job)>> {
        let mut tx = self.pool.begin().await?;
        let job_id = item_owner(&mut tx, item_id).await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT *
            FROM work_items
            WHERE id = $1
              AND status = 'in_progress'
              AND attempts = $2
            FOR UPDATE
            "#,
        )
        .bind(item_id)
        .bind(attempt)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut item = WorkItem::try_from(row)?;

        transitions::fail_item(&mut job, &mut item, failure, now);
        write_item(&mut tx, &item).await?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some((item, job)))
    }

    async fn finalize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let in_flight = any_in_flight(&mut tx, job_id).await?;
        if transitions::finalize(&mut job, in_flight, now)? {
            write_job(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        kind: JobErrorKind,
        now: DateTime<Utc>,
    ) -> FlowResult<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        transitions::fail_job(&mut job, kind, now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn mark_stale_jobs_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FlowResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        // a job locked by a concurrent writer is making progress right now; skip it
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE status = 'in_progress'
              AND last_heartbeat < $1
            ORDER BY last_heartbeat ASC
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut flagged = Vec::with_capacity(rows.len());
        for mut job in jobs_from(rows)? {
            let mut in_flight = lock_items(&mut tx, job.id, &[ItemStatus::InProgress]).await?;
            transitions::mark_stuck(&mut job, in_flight.iter_mut(), now)?;
            write_items(&mut tx, &in_flight).await?;
            write_job(&mut tx, &job).await?;
            flagged.push(job);
        }

        tx.commit().await?;
        Ok(flagged)
    }

    async fn resume_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<ResumeOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let outcome = transitions::resume(&mut job, now)?;
        if !matches!(outcome, ResumeOutcome::Continued { .. }) {
            write_job(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn reset_errored_items(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> FlowResult<ReprocessOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let mut errored = lock_items(&mut tx, job_id, &[ItemStatus::Error]).await?;

        let outcome = transitions::reset_errored(&mut job, errored.iter_mut().collect(), now)?;
        if outcome.reset > 0 {
            write_items(&mut tx, &errored).await?;
            write_job(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn cancel_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let in_flight = any_in_flight(&mut tx, job_id).await?;
        if transitions::cancel(&mut job, in_flight, now)? {
            write_job(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn archive_job(&self, job_id: Uuid, now: DateTime<Utc>) -> FlowResult<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        transitions::archive(&mut job, now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn upsert_worker(
        &self,
        worker_id: &str,
        credential_hash: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<Worker> {
        let worker = sqlx::query_as::<_, Worker>(
            r#"
            INSERT INTO workers (id, credential_hash, active, registered_at)
            VALUES ($1, $2, TRUE, $3)
            ON CONFLICT (id) DO UPDATE
            SET credential_hash = EXCLUDED.credential_hash,
                active = TRUE
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(credential_hash)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(worker)
    }

    async fn get_worker(&self, worker_id: &str) -> FlowResult<Option<Worker>> {
        let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(worker)
    }

    async fn set_worker_active(&self, worker_id: &str, active: bool) -> FlowResult<Worker> {
        let worker = sqlx::query_as::<_, Worker>(
            "UPDATE workers SET active = $2 WHERE id = $1 RETURNING *",
        )
        .bind(worker_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?;
        worker.ok_or_else(|| FlowError::WorkerNotFound(worker_id.to_string()))
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> FlowResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        // 1) A worker that restarted mid-job gets its own job back.
        let held = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE claimed_by = $1
              AND status = 'in_progress'
              AND archived_at IS NULL
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        // 2) Otherwise lock one claimable job; rows other claimers hold are skipped.
        let candidate = match held {
            Some(row) => Some(row),
            None => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT *
                    FROM jobs
                    WHERE topology = 'pull'
                      AND archived_at IS NULL
                      AND (
                            status = 'pending'
                         OR (status = 'in_progress' AND claimed_by IS NULL)
                      )
                    ORDER BY priority DESC, created_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let Some(row) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        // 3) Lease it.
        let mut job = Job::try_from(row)?;
        transitions::claim_job(&mut job, worker_id, lease, now);
        write_job(&mut tx, &job).await?;
        touch_worker(&mut tx, worker_id, now).await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn heartbeat_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reports: &[ItemReport],
        lease: Duration,
        now: DateTime<Utc>,
    ) -> FlowResult<HeartbeatAck> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        if !transitions::accepts_heartbeat(&job, worker_id) {
            tx.commit().await?;
            return Ok(HeartbeatAck {
                job,
                directive: Directive::Stop,
                applied: 0,
            });
        }

        let mut applied = 0;
        if !reports.is_empty() {
            let ids: Vec<Uuid> = reports.iter().map(|r| r.item_id).collect();
            let rows = sqlx::query_as::<_, ItemRow>(
                "SELECT * FROM work_items WHERE job_id = $1 AND id = ANY($2) ORDER BY seq FOR UPDATE",
            )
            .bind(job_id)
            .bind(ids)
            .fetch_all(&mut *tx)
            .await?;

            let mut items: HashMap<Uuid, WorkItem> = items_from(rows)?
                .into_iter()
                .map(|item| (item.id, item))
                .collect();

            let mut changed = Vec::new();
            for report in reports {
                if let Some(item) = items.get_mut(&report.item_id) {
                    if transitions::report_item(&mut job, item, &report.outcome, now) {
                        applied += 1;
                        changed.push(item.clone());
                    }
                }
            }
            write_items(&mut tx, &changed).await?;
        }

        let directive = transitions::heartbeat(&mut job, lease, now);
        write_job(&mut tx, &job).await?;
        touch_worker(&mut tx, worker_id, now).await?;
        tx.commit().await?;

        Ok(HeartbeatAck {
            job,
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
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        if !job.is_claimed_by(worker_id) {
            tx.commit().await?;
            return Ok(CompleteAck {
                accepted: false,
                job,
            });
        }
        if job.status != JobStatus::InProgress {
            transitions::release_cancelled(&mut job, now);
            write_job(&mut tx, &job).await?;
            tx.commit().await?;
            return Ok(CompleteAck {
                accepted: false,
                job,
            });
        }

        let mut remaining = lock_items(
            &mut tx,
            job_id,
            &[ItemStatus::Pending, ItemStatus::InProgress],
        )
        .await?;
        transitions::complete_claimed(&mut job, remaining.iter_mut(), outcome, now)?;
        write_items(&mut tx, &remaining).await?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;

        Ok(CompleteAck {
            accepted: true,
            job,
        })
    }
}
