use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::error;
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::error::FlowError;
use crate::jobs::manager::{ErrorView, JobManager, JobStatusView};
use crate::jobs::model::{
    ClaimedJob, CompleteAck, HeartbeatAck, Job, JobFilter, JobOutcome, JobStatus, ResumeOutcome,
    Worker,
};
use crate::jobs::watchdog::SweepReport;

pub mod models;

use models::{
    CreateJobRequest, CreateJobResponse, ErrorBody, HeartbeatRequest, ListJobsQuery,
    RegisterWorkerRequest, ReprocessResponse, ResumeResponse,
};

pub const WORKER_ID_HEADER: &str = "x-worker-id";
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<JobManager>,
    pub defaults: JobDefaults,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Jobs
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_status))
        .route("/jobs/:id/errors", get(list_errors))
        // Recovery
        .route("/jobs/:id/resume", post(resume_job))
        .route("/jobs/:id/reprocess", post(reprocess_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/archive", post(archive_job))
        // Workers
        .route("/workers", post(register_worker))
        .route("/workers/claim", post(claim_job))
        .route("/workers/:id/deactivate", post(deactivate_worker))
        .route("/jobs/:id/heartbeat", post(heartbeat_job))
        .route("/jobs/:id/complete", post(complete_job))
        // Watchdog
        .route("/watchdog/sweep", post(sweep))
        // Metrics
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

pub struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FlowError::JobNotFound(_) | FlowError::ItemNotFound(_) | FlowError::WorkerNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FlowError::InvalidTransition { .. } | FlowError::ReprocessLimit(_) => {
                StatusCode::CONFLICT
            }
            FlowError::Validation(_) => StatusCode::BAD_REQUEST,
            FlowError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FlowError::Storage(_) | FlowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn create_job(
    State(state): State<ApiState>,
    Json(body): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let (job, _dispatch) = state
        .manager
        .create_job(body.into_new_job(&state.defaults))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
            topology: job.topology,
            total_items: job.total_items,
        }),
    ))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobStatusView>>> {
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| FlowError::Validation(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };

    let filter = JobFilter {
        status,
        include_archived: q.include_archived.unwrap_or(false),
        limit: q.limit.unwrap_or(100),
    };
    let jobs = state.manager.list_jobs(&filter).await?;
    Ok(Json(
        jobs.into_iter()
            .map(|job| state.manager.status_view(job))
            .collect(),
    ))
}

pub async fn get_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobStatusView>> {
    Ok(Json(state.manager.get_status(id).await?))
}

pub async fn list_errors(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ErrorView>>> {
    Ok(Json(state.manager.list_errors(id).await?))
}

pub async fn resume_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ResumeResponse>> {
    let (outcome, dispatch) = state.manager.resume(id).await?;
    let label = match &outcome {
        ResumeOutcome::Resumed { .. } => "resumed",
        ResumeOutcome::Continued { .. } => "continued",
        ResumeOutcome::Exhausted { .. } => "exhausted",
    };
    Ok(Json(ResumeResponse {
        outcome: label,
        dispatched: dispatch.is_some(),
        job: outcome.job().clone(),
    }))
}

pub async fn reprocess_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReprocessResponse>> {
    let (outcome, dispatch) = state.manager.reprocess_errors(id).await?;
    Ok(Json(ReprocessResponse {
        reset: outcome.reset,
        dispatched: dispatch.is_some(),
        job: outcome.job,
    }))
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.manager.cancel(id).await?))
}

pub async fn archive_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.manager.archive(id).await?))
}

pub async fn register_worker(
    State(state): State<ApiState>,
    Json(body): Json<RegisterWorkerRequest>,
) -> ApiResult<(StatusCode, Json<Worker>)> {
    let worker = state
        .manager
        .workers()
        .register(&body.worker_id, &body.token)
        .await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

pub async fn deactivate_worker(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.manager.workers().deactivate(&id).await?))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Worker id from the auth headers, once the token checks out.
async fn authenticated_worker(state: &ApiState, headers: &HeaderMap) -> ApiResult<String> {
    let (Some(worker_id), Some(token)) = (
        header_value(headers, WORKER_ID_HEADER),
        header_value(headers, WORKER_TOKEN_HEADER),
    ) else {
        return Err(FlowError::Unauthorized("anonymous".into()).into());
    };

    let worker = state.manager.workers().authenticate(worker_id, token).await?;
    Ok(worker.id)
}

pub async fn claim_job(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<Response> {
    let worker_id = authenticated_worker(&state, &headers).await?;
    let claimed: Option<ClaimedJob> = state.manager.workers().claim(&worker_id).await?;
    Ok(match claimed {
        Some(claimed) => (StatusCode::OK, Json(claimed)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn heartbeat_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<HeartbeatRequest>>,
) -> ApiResult<Json<HeartbeatAck>> {
    let worker_id = authenticated_worker(&state, &headers).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ack = state
        .manager
        .workers()
        .heartbeat(id, &worker_id, &body.reports)
        .await?;
    Ok(Json(ack))
}

pub async fn complete_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(outcome): Json<JobOutcome>,
) -> ApiResult<Json<CompleteAck>> {
    let worker_id = authenticated_worker(&state, &headers).await?;
    let ack = state
        .manager
        .workers()
        .complete(id, &worker_id, &outcome)
        .await?;
    Ok(Json(ack))
}

pub async fn sweep(State(state): State<ApiState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.manager.run_watchdog_sweep().await?))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match state.manager.job_counts().await {
        Ok(counts) => {
            let mut body = String::from(concat!(
                "# HELP jobflow_jobs Number of jobs by status\n",
                "# TYPE jobflow_jobs gauge\n",
            ));
            for (status, n) in counts {
                body.push_str(&format!("jobflow_jobs{{status=\"{status}\"}} {n}\n"));
            }
            (StatusCode::OK, body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
