// crates/jobflow/src/api/models.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::jobs::model::{ItemReport, Job, JobStatus, NewJob, Topology};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    pub items: Vec<Value>,
    pub config: Option<Value>,
    pub topology: Option<Topology>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub max_retries: Option<i32>,
    pub max_reprocess_cycles: Option<i32>,
    pub partial_failure_is_error: Option<bool>,
}

impl CreateJobRequest {
    pub fn into_new_job(self, defaults: &JobDefaults) -> NewJob {
        let mut job = NewJob::new(self.job_type, self.items)
            .topology(self.topology.unwrap_or_default())
            .priority(self.priority.unwrap_or(0))
            .max_attempts(self.max_attempts.unwrap_or(defaults.max_attempts))
            .max_retries(self.max_retries.unwrap_or(defaults.max_retries))
            .max_reprocess_cycles(
                self.max_reprocess_cycles
                    .unwrap_or(defaults.max_reprocess_cycles),
            )
            .partial_failure_is_error(self.partial_failure_is_error.unwrap_or(true));
        if let Some(config) = self.config {
            job = job.config(config);
        }
        job
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub topology: Topology,
    pub total_items: i32,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub include_archived: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub outcome: &'static str,
    pub dispatched: bool,
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct ReprocessResponse {
    pub reset: usize,
    pub dispatched: bool,
    pub job: Job,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub token: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub reports: Vec<ItemReport>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
