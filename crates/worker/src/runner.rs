use std::time::Duration;

use jobflow::jobs::model::{
    ClaimedJob, Directive, ItemReport, JobOutcome, ReportedOutcome, WorkItem,
};
use jobflow::jobs::retry::{classify_error, next_delay, ErrorClass, RetryConfig};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::JobServer;
use crate::config::WorkerConfig;
use crate::handlers::{HandlerEntry, HandlerRegistry, ItemContext, ItemResult};

/// Works through a claimed job: runs each item, reports progress on heartbeats and
/// completes the job. Returns early when the server says stop.
pub async fn run_job(
    server: &dyn JobServer,
    registry: &HandlerRegistry,
    cfg: &WorkerConfig,
    retry: &RetryConfig,
    claimed: ClaimedJob,
) -> anyhow::Result<()> {
    let job = claimed.job;
    info!(
        job_id = %job.id,
        job_type = %job.job_type,
        items = claimed.items.len(),
        "claimed job"
    );

    let Some(entry) = registry.handler_for(&job.job_type) else {
        let ack = server
            .complete(
                job.id,
                &JobOutcome::Failed {
                    detail: format!("no handler for job_type={}", job.job_type),
                },
            )
            .await?;
        warn!(job_id = %job.id, accepted = ack.accepted, "no handler; reported job as failed");
        return Ok(());
    };

    let ctx = ItemContext {
        worker_id: cfg.worker_id.clone(),
        job_id: job.id,
        config: job.config.clone(),
    };

    let lease = job
        .claim_expires_at
        .and_then(|expires| (expires - job.last_heartbeat).to_std().ok())
        .unwrap_or(cfg.heartbeat_interval * 4);
    let mut reporter = Reporter::new(server, job.id, lease);

    let mut ticker = tokio::time::interval(cfg.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    for item in &claimed.items {
        let work = process_item(&entry, item, &ctx, retry);
        tokio::pin!(work);

        // keep the lease alive while a long item runs
        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = ticker.tick() => {
                    if reporter.flush().await? == Some(Directive::Stop) {
                        info!(job_id = %job.id, "server said stop; abandoning job");
                        return Ok(());
                    }
                }
            }
        };

        debug!(job_id = %job.id, item_id = %item.id, seq = item.seq, "item finished");
        reporter.push(ItemReport {
            item_id: item.id,
            outcome,
        });

        if reporter.pending() >= cfg.heartbeat_every
            && reporter.flush().await? == Some(Directive::Stop)
        {
            info!(job_id = %job.id, "server said stop; abandoning job");
            return Ok(());
        }
    }

    // every report must land before the job is completed
    loop {
        match reporter.flush().await? {
            Some(Directive::Continue) => break,
            Some(Directive::Stop) => {
                info!(job_id = %job.id, "server said stop before completion");
                return Ok(());
            }
            None => tokio::time::sleep(cfg.poll_interval).await,
        }
    }

    let ack = server.complete(job.id, &JobOutcome::Succeeded).await?;
    if ack.accepted {
        info!(
            job_id = %job.id,
            status = %ack.job.status,
            completed = ack.job.completed_count,
            errors = ack.job.error_count,
            "job completed"
        );
    } else {
        warn!(job_id = %job.id, status = %ack.job.status, "completion rejected; claim was lost");
    }
    Ok(())
}

/// Buffers finished items until a heartbeat carries them to the server.
struct Reporter<'a> {
    server: &'a dyn JobServer,
    job_id: Uuid,
    buffered: Vec<ItemReport>,
    lease: Duration,
    last_ack: Instant,
}

impl<'a> Reporter<'a> {
    fn new(server: &'a dyn JobServer, job_id: Uuid, lease: Duration) -> Self {
        Self {
            server,
            job_id,
            buffered: Vec::new(),
            lease,
            last_ack: Instant::now(),
        }
    }

    fn push(&mut self, report: ItemReport) {
        self.buffered.push(report);
    }

    fn pending(&self) -> usize {
        self.buffered.len()
    }

    /// Sends buffered reports with a heartbeat. On failure the reports stay buffered for
    /// the next flush and `None` is returned; once no heartbeat has landed for a whole
    /// lease the claim is presumed lost and the error is returned.
    async fn flush(&mut self) -> anyhow::Result<Option<Directive>> {
        match self.server.heartbeat(self.job_id, &self.buffered).await {
            Ok(ack) => {
                debug!(
                    job_id = %self.job_id,
                    sent = self.buffered.len(),
                    applied = ack.applied,
                    processed = ack.job.processed_count(),
                    total = ack.job.total_items,
                    "heartbeat"
                );
                self.buffered.clear();
                self.last_ack = Instant::now();
                Ok(Some(ack.directive))
            }
            Err(e) if self.last_ack.elapsed() >= self.lease => Err(e.context(format!(
                "no heartbeat accepted for {}s; dropping {} buffered reports",
                self.lease.as_secs(),
                self.buffered.len()
            ))),
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    buffered = self.buffered.len(),
                    error = %e,
                    "heartbeat failed; keeping reports for the next one"
                );
                Ok(None)
            }
        }
    }
}

/// Runs one item, retrying retryable codes locally within the item's remaining attempts.
pub async fn process_item(
    entry: &HandlerEntry,
    item: &WorkItem,
    ctx: &ItemContext,
    retry: &RetryConfig,
) -> ReportedOutcome {
    let budget = (item.max_attempts - item.attempts).max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match entry.run(item, ctx).await {
            Ok(ItemResult::Done(output)) => return ReportedOutcome::Done { output },
            Ok(ItemResult::Skipped(reason)) => return ReportedOutcome::Skipped { reason },
            Err(err) => {
                if attempt < budget && classify_error(err.code) == ErrorClass::Retryable {
                    let delay = next_delay(attempt, retry, &mut rand::thread_rng());
                    warn!(
                        job_id = %ctx.job_id,
                        item_id = %item.id,
                        code = err.code,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "item failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return ReportedOutcome::Failed {
                    code: Some(err.code.to_string()),
                    detail: err.message,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use jobflow::jobs::model::{CompleteAck, HeartbeatAck, Job, NewJob, Topology};
    use jobflow::jobs::{JobStore, MemoryJobStore};
    use serde_json::{json, Value};

    use super::*;
    use crate::handlers::{boxed, ItemError};

    /// Records every call; `failures` scripts heartbeat errors in call order.
    struct FakeServer {
        job: Job,
        failures: Mutex<VecDeque<bool>>,
        always_fail: bool,
        stop: bool,
        heartbeats: Mutex<Vec<Vec<Uuid>>>,
        completions: Mutex<Vec<JobOutcome>>,
    }

    impl FakeServer {
        fn new(job: &Job) -> Self {
            Self {
                job: job.clone(),
                failures: Mutex::new(VecDeque::new()),
                always_fail: false,
                stop: false,
                heartbeats: Mutex::new(Vec::new()),
                completions: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<Vec<Uuid>> {
            self.heartbeats.lock().unwrap().clone()
        }

        fn completions(&self) -> usize {
            self.completions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobServer for FakeServer {
        async fn heartbeat(
            &self,
            _job_id: Uuid,
            reports: &[ItemReport],
        ) -> anyhow::Result<HeartbeatAck> {
            self.heartbeats
                .lock()
                .unwrap()
                .push(reports.iter().map(|r| r.item_id).collect());
            let scripted = self.failures.lock().unwrap().pop_front().unwrap_or(false);
            if self.always_fail || scripted {
                anyhow::bail!("connection reset");
            }
            Ok(HeartbeatAck {
                job: self.job.clone(),
                directive: if self.stop {
                    Directive::Stop
                } else {
                    Directive::Continue
                },
                applied: reports.len(),
            })
        }

        async fn complete(&self, _job_id: Uuid, outcome: &JobOutcome) -> anyhow::Result<CompleteAck> {
            self.completions.lock().unwrap().push(outcome.clone());
            Ok(CompleteAck {
                accepted: true,
                job: self.job.clone(),
            })
        }
    }

    async fn claimed(job_type: &str, n: usize) -> ClaimedJob {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let inputs: Vec<Value> = (0..n).map(|i| json!({ "epoch": i })).collect();
        let mut job = store
            .create_job(NewJob::new(job_type, inputs).topology(Topology::Pull), now)
            .await
            .unwrap();
        let items = store.list_items(job.id, None).await.unwrap();
        job.claimed_by = Some("gpu-0".into());
        job.claim_expires_at = Some(now + chrono::Duration::seconds(60));
        ClaimedJob { job, items }
    }

    fn cfg(heartbeat_every: usize) -> WorkerConfig {
        WorkerConfig {
            server_url: "http://unused".into(),
            worker_id: "gpu-0".into(),
            token: "token-secret".into(),
            poll_interval: Duration::from_millis(5),
            heartbeat_every,
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    fn registry_with(job_type: &str, calls: Arc<AtomicUsize>, fail_first: usize, code: &'static str) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(job_type, None, move |_item, _ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            boxed(async move {
                if n < fail_first {
                    Err(ItemError::new(code, "simulated"))
                } else {
                    Ok(ItemResult::Done(Some(json!({ "call": n }))))
                }
            })
        });
        registry
    }

    fn ctx() -> ItemContext {
        ItemContext {
            worker_id: "gpu-0".into(),
            job_id: Uuid::new_v4(),
            config: json!({}),
        }
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_locally() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with("flaky", calls.clone(), 2, "TIMEOUT");
        let entry = registry.handler_for("flaky").unwrap();
        let job = claimed("flaky", 1).await;

        let outcome = process_item(&entry, &job.items[0], &ctx(), &RetryConfig::immediate()).await;
        assert!(matches!(outcome, ReportedOutcome::Done { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_remaining_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with("flaky", calls.clone(), usize::MAX, "RATE_LIMIT");
        let entry = registry.handler_for("flaky").unwrap();
        let mut item = claimed("flaky", 1).await.items.remove(0);
        item.attempts = 1;
        item.max_attempts = 3;

        let outcome = process_item(&entry, &item, &ctx(), &RetryConfig::immediate()).await;
        match outcome {
            ReportedOutcome::Failed { code, .. } => assert_eq!(code.as_deref(), Some("RATE_LIMIT")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_reported_at_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with("strict", calls.clone(), usize::MAX, "UNPROCESSABLE");
        let entry = registry.handler_for("strict").unwrap();
        let job = claimed("strict", 1).await;

        let outcome = process_item(&entry, &job.items[0], &ctx(), &RetryConfig::immediate()).await;
        match outcome {
            ReportedOutcome::Failed { code, detail } => {
                assert_eq!(code.as_deref(), Some("UNPROCESSABLE"));
                assert_eq!(detail, "simulated");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reports_are_batched_then_the_job_completes() {
        let registry = registry_with("noop", Arc::new(AtomicUsize::new(0)), 0, "TIMEOUT");
        let job = claimed("noop", 5).await;
        let server = FakeServer::new(&job.job);

        run_job(&server, &registry, &cfg(2), &RetryConfig::immediate(), job)
            .await
            .unwrap();

        let sizes: Vec<usize> = server.sent().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(server.completions(), 1);
    }

    #[tokio::test]
    async fn stop_directive_abandons_the_job() {
        let registry = registry_with("noop", Arc::new(AtomicUsize::new(0)), 0, "TIMEOUT");
        let job = claimed("noop", 4).await;
        let mut server = FakeServer::new(&job.job);
        server.stop = true;

        run_job(&server, &registry, &cfg(2), &RetryConfig::immediate(), job)
            .await
            .unwrap();

        assert_eq!(server.sent().len(), 1);
        assert_eq!(server.completions(), 0);
    }

    #[tokio::test]
    async fn failed_heartbeat_keeps_its_reports() {
        let registry = registry_with("noop", Arc::new(AtomicUsize::new(0)), 0, "TIMEOUT");
        let job = claimed("noop", 3).await;
        let ids: Vec<Uuid> = job.items.iter().map(|item| item.id).collect();
        let server = FakeServer::new(&job.job);
        server.failures.lock().unwrap().extend([true, false]);

        run_job(&server, &registry, &cfg(2), &RetryConfig::immediate(), job)
            .await
            .unwrap();

        let sent = server.sent();
        // first flush is lost in transit; the next one carries it again
        assert_eq!(sent[0], ids[..2].to_vec());
        assert_eq!(sent[1], ids);
        assert_eq!(server.completions(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_gives_up_after_the_lease() {
        let registry = registry_with("noop", Arc::new(AtomicUsize::new(0)), 0, "TIMEOUT");
        let mut job = claimed("noop", 2).await;
        job.job.claim_expires_at = Some(job.job.last_heartbeat);
        let mut server = FakeServer::new(&job.job);
        server.always_fail = true;

        let err = run_job(&server, &registry, &cfg(1), &RetryConfig::immediate(), job)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
        assert_eq!(server.completions(), 0);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_the_job() {
        let registry = HandlerRegistry::new();
        let job = claimed("mystery", 1).await;
        let server = FakeServer::new(&job.job);

        run_job(&server, &registry, &cfg(1), &RetryConfig::immediate(), job)
            .await
            .unwrap();

        let outcomes = server.completions.lock().unwrap().clone();
        assert!(matches!(&outcomes[..], [JobOutcome::Failed { .. }]));
        assert!(server.sent().is_empty());
    }
}
