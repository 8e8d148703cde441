use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::FlowResult;
use crate::jobs::heartbeat;
use crate::jobs::store::JobStore;

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub swept_at: DateTime<Utc>,
    pub threshold_secs: i64,
    pub stuck: Vec<Uuid>,
}

/// Liveness scan over IN_PROGRESS jobs. Looks only at heartbeat timestamps, never at
/// item content.
#[derive(Clone)]
pub struct Watchdog {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self {
            store,
            clock,
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Flags every IN_PROGRESS job whose heartbeat is older than the threshold as STUCK.
    pub async fn sweep(&self) -> FlowResult<SweepReport> {
        let now = self.clock.now();
        let cutoff = heartbeat::stale_cutoff(now, self.threshold);
        let flagged = self.store.mark_stale_jobs_stuck(cutoff, now).await?;

        for job in &flagged {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                heartbeat_age_secs = job.heartbeat_age(now).num_seconds(),
                last_item_processed = job.last_item_processed.as_deref().unwrap_or("-"),
                processed = job.processed_count(),
                total = job.total_items,
                "job stuck: heartbeat went stale"
            );
        }
        if flagged.is_empty() {
            debug!("watchdog sweep: nothing stale");
        }

        Ok(SweepReport {
            swept_at: now,
            threshold_secs: self.threshold.num_seconds(),
            stuck: flagged.into_iter().map(|job| job.id).collect(),
        })
    }

    /// Sweeps on a fixed interval until a storage error, which ends the task with `Err`.
    pub fn spawn(self, every: std::time::Duration) -> JoinHandle<FlowResult<()>> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    error!(error = %e, "watchdog sweep failed");
                    return Err(e);
                }
            }
        })
    }
}
