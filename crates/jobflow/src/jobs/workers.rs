use std::sync::Arc;

use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FlowError, FlowResult};
use crate::jobs::model::{
    ClaimedJob, CompleteAck, Directive, HeartbeatAck, ItemReport, JobOutcome, Worker,
};
use crate::jobs::store::JobStore;

/// Hex-encoded SHA-256 of a worker token. Only the hash is stored.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Server side of the pull topology: remote workers claim a whole job, report progress
/// on heartbeats, and finish it with `complete`. The job row is the lease.
#[derive(Clone)]
pub struct WorkerProtocol {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl WorkerProtocol {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            store,
            clock,
            lease,
        }
    }

    pub async fn register(&self, worker_id: &str, token: &str) -> FlowResult<Worker> {
        if worker_id.trim().is_empty() {
            return Err(FlowError::Validation("worker id is required".into()));
        }
        if token.len() < 8 {
            return Err(FlowError::Validation(
                "worker token must be at least 8 characters".into(),
            ));
        }
        let worker = self
            .store
            .upsert_worker(worker_id, &hash_token(token), self.clock.now())
            .await?;
        info!(worker_id = %worker.id, "worker registered");
        Ok(worker)
    }

    pub async fn deactivate(&self, worker_id: &str) -> FlowResult<Worker> {
        let worker = self.store.set_worker_active(worker_id, false).await?;
        info!(worker_id = %worker.id, "worker deactivated");
        Ok(worker)
    }

    /// Active worker whose token matches the stored hash.
    pub async fn authenticate(&self, worker_id: &str, token: &str) -> FlowResult<Worker> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| FlowError::Unauthorized(worker_id.to_string()))?;
        if !worker.active || worker.credential_hash != hash_token(token) {
            return Err(FlowError::Unauthorized(worker_id.to_string()));
        }
        Ok(worker)
    }

    /// One job for this worker, or `None` when nothing is claimable.
    pub async fn claim(&self, worker_id: &str) -> FlowResult<Option<ClaimedJob>> {
        let active = self
            .store
            .get_worker(worker_id)
            .await?
            .is_some_and(|w| w.active);
        if !active {
            return Err(FlowError::Unauthorized(worker_id.to_string()));
        }

        let Some(job) = self
            .store
            .claim_job(worker_id, self.lease, self.clock.now())
            .await?
        else {
            debug!(worker_id = %worker_id, "claim: nothing available");
            return Ok(None);
        };

        let items = self
            .store
            .list_items(job.id, None)
            .await?
            .into_iter()
            .filter(|item| !item.status.is_terminal())
            .collect::<Vec<_>>();

        info!(
            worker_id = %worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            remaining_items = items.len(),
            lease_expires_at = ?job.claim_expires_at,
            "job claimed"
        );
        Ok(Some(ClaimedJob { job, items }))
    }

    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reports: &[ItemReport],
    ) -> FlowResult<HeartbeatAck> {
        let ack = self
            .store
            .heartbeat_job(job_id, worker_id, reports, self.lease, self.clock.now())
            .await?;

        match ack.directive {
            Directive::Continue => debug!(
                worker_id = %worker_id,
                job_id = %job_id,
                applied = ack.applied,
                processed = ack.job.processed_count(),
                total = ack.job.total_items,
                "heartbeat"
            ),
            Directive::Stop => warn!(
                worker_id = %worker_id,
                job_id = %job_id,
                status = %ack.job.status,
                claimed_by = ack.job.claimed_by.as_deref().unwrap_or("-"),
                "heartbeat from a worker that should stop"
            ),
        }
        Ok(ack)
    }

    /// Rejected (with the recorded job) when the caller no longer holds the claim.
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> FlowResult<CompleteAck> {
        let ack = self
            .store
            .complete_claimed_job(job_id, worker_id, outcome, self.clock.now())
            .await?;

        if ack.accepted {
            info!(
                worker_id = %worker_id,
                job_id = %job_id,
                status = %ack.job.status,
                completed = ack.job.completed_count,
                errors = ack.job.error_count,
                "job completed by worker"
            );
        } else {
            warn!(
                worker_id = %worker_id,
                job_id = %job_id,
                status = %ack.job.status,
                claimed_by = ack.job.claimed_by.as_deref().unwrap_or("-"),
                "complete rejected: worker no longer holds the claim"
            );
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_stable_hex() {
        let a = hash_token("s3cret-token");
        assert_eq!(a.len(), 64);
        assert_eq!(a, hash_token("s3cret-token"));
        assert_ne!(a, hash_token("s3cret-tokem"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
