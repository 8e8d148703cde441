use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::error::{FlowError, FlowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Stuck,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Error,
        JobStatus::Stuck,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Stuck => "stuck",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim().to_lowercase())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(ItemStatus::Pending),
            "in_progress" => Some(ItemStatus::InProgress),
            "done" => Some(ItemStatus::Done),
            "error" => Some(ItemStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Error)
    }
}

/// Who drives a job: the server's own dispatcher, or a remote worker that claims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    InProcess,
    Pull,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::InProcess => "in_process",
            Topology::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "in_process" => Some(Topology::InProcess),
            "pull" => Some(Topology::Pull),
            _ => None,
        }
    }
}

/// Why a job ended in ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Every item is terminal and at least one failed.
    ItemFailures,
    /// Stuck with no resumes left.
    RetriesExhausted,
    /// The remote worker reported the job as failed.
    WorkerFailed,
    /// Infrastructure error while dispatching.
    Fatal,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::ItemFailures => "item_failures",
            JobErrorKind::RetriesExhausted => "retries_exhausted",
            JobErrorKind::WorkerFailed => "worker_failed",
            JobErrorKind::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "item_failures" => Some(JobErrorKind::ItemFailures),
            "retries_exhausted" => Some(JobErrorKind::RetriesExhausted),
            "worker_failed" => Some(JobErrorKind::WorkerFailed),
            "fatal" => Some(JobErrorKind::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub topology: Topology,
    pub status: JobStatus,
    pub config: Value,
    pub priority: i32,

    pub total_items: i32,
    pub completed_count: i32,
    pub error_count: i32,
    pub skipped_count: i32,

    pub last_heartbeat: DateTime<Utc>,
    pub last_item_processed: Option<String>,

    pub retry_count: i32,
    pub max_retries: i32,
    pub reprocess_count: i32,
    pub max_reprocess_cycles: i32,
    pub partial_failure_is_error: bool,
    pub error_kind: Option<JobErrorKind>,

    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn processed_count(&self) -> i32 {
        self.completed_count + self.error_count + self.skipped_count
    }

    pub fn all_items_terminal(&self) -> bool {
        self.processed_count() >= self.total_items
    }

    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.claimed_by.as_deref() == Some(worker_id)
    }

    /// Time since the last recorded progress; never negative.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).max(Duration::zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub job_id: Uuid,
    pub seq: i32,
    pub input: Value,
    pub status: ItemStatus,
    pub attempts: i32,
    pub max_attempts: i32,

    pub output: Option<Value>,
    pub skip_reason: Option<String>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn can_attempt(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: String,
    #[serde(skip_serializing, default)]
    pub credential_hash: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub topology: Topology,
    pub config: Value,
    pub items: Vec<Value>,
    pub priority: i32,
    pub max_attempts: i32,
    pub max_retries: i32,
    pub max_reprocess_cycles: i32,
    pub partial_failure_is_error: bool,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, items: Vec<Value>) -> Self {
        let defaults = JobDefaults::default();
        Self {
            job_type: job_type.into(),
            topology: Topology::InProcess,
            config: Value::Object(Default::default()),
            items,
            priority: 0,
            max_attempts: defaults.max_attempts,
            max_retries: defaults.max_retries,
            max_reprocess_cycles: defaults.max_reprocess_cycles,
            partial_failure_is_error: true,
        }
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn max_retries(mut self, n: i32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn max_reprocess_cycles(mut self, n: i32) -> Self {
        self.max_reprocess_cycles = n;
        self
    }

    pub fn partial_failure_is_error(mut self, yes: bool) -> Self {
        self.partial_failure_is_error = yes;
        self
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(FlowError::Validation("job_type is required".into()));
        }
        if self.max_attempts <= 0 {
            return Err(FlowError::Validation("max_attempts must be > 0".into()));
        }
        if self.max_retries < 0 {
            return Err(FlowError::Validation("max_retries must be >= 0".into()));
        }
        if self.max_reprocess_cycles < 0 {
            return Err(FlowError::Validation(
                "max_reprocess_cycles must be >= 0".into(),
            ));
        }
        if i32::try_from(self.items.len()).is_err() {
            return Err(FlowError::Validation("too many items".into()));
        }
        Ok(())
    }

    /// Fresh PENDING records for this request; items keep their submission order as `seq`.
    pub fn into_records(self, job_id: Uuid, now: DateTime<Utc>) -> (Job, Vec<WorkItem>) {
        let max_attempts = self.max_attempts;
        let items: Vec<WorkItem> = self
            .items
            .into_iter()
            .enumerate()
            .map(|(seq, input)| WorkItem {
                id: Uuid::new_v4(),
                job_id,
                seq: seq as i32,
                input,
                status: ItemStatus::Pending,
                attempts: 0,
                max_attempts,
                output: None,
                skip_reason: None,
                error_code: None,
                error_detail: None,
                last_error_at: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        let job = Job {
            id: job_id,
            job_type: self.job_type,
            topology: self.topology,
            status: JobStatus::Pending,
            config: self.config,
            priority: self.priority,
            total_items: items.len() as i32,
            completed_count: 0,
            error_count: 0,
            skipped_count: 0,
            last_heartbeat: now,
            last_item_processed: None,
            retry_count: 0,
            max_retries: self.max_retries,
            reprocess_count: 0,
            max_reprocess_cycles: self.max_reprocess_cycles,
            partial_failure_is_error: self.partial_failure_is_error,
            error_kind: None,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            archived_at: None,
        };
        (job, items)
    }
}

/// Successful result of one item attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemCompletion {
    Done { output: Option<Value> },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Typed failure returned by an item processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl ItemFailure {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Kind derived from the error code table.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let kind = super::retry::classify_error(code).into();
        Self {
            kind,
            code: code.trim().to_uppercase(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// STUCK -> IN_PROGRESS; retry_count was incremented.
    Resumed { job: Job },
    /// Already IN_PROGRESS; nothing changed.
    Continued { job: Job },
    /// STUCK with no resumes left; the job is now ERROR.
    Exhausted { job: Job },
}

impl ResumeOutcome {
    pub fn job(&self) -> &Job {
        match self {
            ResumeOutcome::Resumed { job }
            | ResumeOutcome::Continued { job }
            | ResumeOutcome::Exhausted { job } => job,
        }
    }

    pub fn should_dispatch(&self) -> bool {
        !matches!(self, ResumeOutcome::Exhausted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessOutcome {
    pub job: Job,
    pub reset: usize,
}

/// Final result a remote worker reports for a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { detail: String },
}

/// Per-item progress a remote worker piggybacks on a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub item_id: Uuid,
    pub outcome: ReportedOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportedOutcome {
    Done {
        #[serde(default)]
        output: Option<Value>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        #[serde(default)]
        code: Option<String>,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub job: Job,
    pub directive: Directive,
    pub applied: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAck {
    pub accepted: bool,
    pub job: Job,
}

/// A job handed to a remote worker together with the items still to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job: Job,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub include_archived: bool,
    pub limit: i64,
}

impl JobFilter {
    pub fn clamped_limit(&self) -> i64 {
        if self.limit <= 0 {
            100
        } else {
            self.limit.clamp(1, 500)
        }
    }
}
