use anyhow::Context;
use async_trait::async_trait;
use jobflow::api::{WORKER_ID_HEADER, WORKER_TOKEN_HEADER};
use jobflow::jobs::model::{ClaimedJob, CompleteAck, HeartbeatAck, ItemReport, JobOutcome};
use reqwest::StatusCode;
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    reports: &'a [ItemReport],
}

/// Calls a worker makes while it holds a job.
#[async_trait]
pub trait JobServer: Send + Sync {
    async fn heartbeat(&self, job_id: Uuid, reports: &[ItemReport]) -> anyhow::Result<HeartbeatAck>;

    async fn complete(&self, job_id: Uuid, outcome: &JobOutcome) -> anyhow::Result<CompleteAck>;
}

/// HTTP side of the claim / heartbeat / complete protocol.
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    worker_id: String,
    token: String,
}

impl ServerClient {
    pub fn new(base_url: &str, worker_id: &str, token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
            token: token.to_string(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .header(WORKER_ID_HEADER, &self.worker_id)
            .header(WORKER_TOKEN_HEADER, &self.token)
    }

    /// `None` when the server has nothing to hand out.
    pub async fn claim(&self) -> anyhow::Result<Option<ClaimedJob>> {
        let res = self.post("/workers/claim").send().await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let res = ensure_ok(res, "claim").await?;
        Ok(Some(res.json().await?))
    }
}

#[async_trait]
impl JobServer for ServerClient {
    async fn heartbeat(
        &self,
        job_id: Uuid,
        reports: &[ItemReport],
    ) -> anyhow::Result<HeartbeatAck> {
        let res = self
            .post(&format!("/jobs/{job_id}/heartbeat"))
            .json(&HeartbeatBody { reports })
            .send()
            .await?;
        let res = ensure_ok(res, "heartbeat").await?;
        Ok(res.json().await?)
    }

    async fn complete(&self, job_id: Uuid, outcome: &JobOutcome) -> anyhow::Result<CompleteAck> {
        let res = self
            .post(&format!("/jobs/{job_id}/complete"))
            .json(outcome)
            .send()
            .await?;
        let res = ensure_ok(res, "complete").await?;
        Ok(res.json().await?)
    }
}

async fn ensure_ok(res: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("{what} failed: {status} {body}")).context("server rejected request")
}
