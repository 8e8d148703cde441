use jobflow::jobs::retry::RetryConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod handlers;
mod runner;

use client::ServerClient;
use config::WorkerConfig;
use handlers::{build_registry, HandlerRegistry};
use runner::run_job;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = WorkerConfig::from_env()?;
    info!(
        worker_id = %cfg.worker_id,
        server = %cfg.server_url,
        poll_interval_ms = cfg.poll_interval.as_millis() as u64,
        heartbeat_every = cfg.heartbeat_every,
        heartbeat_interval_secs = cfg.heartbeat_interval.as_secs(),
        "worker starting"
    );

    let client = ServerClient::new(&cfg.server_url, &cfg.worker_id, &cfg.token)?;
    let registry = build_registry();

    tokio::select! {
        res = poll_loop(&client, &registry, &cfg) => res,
        _ = tokio::signal::ctrl_c() => {
            info!(worker_id = %cfg.worker_id, "shutting down; a held job is re-attached on next start");
            Ok(())
        }
    }
}

async fn poll_loop(
    client: &ServerClient,
    registry: &HandlerRegistry,
    cfg: &WorkerConfig,
) -> anyhow::Result<()> {
    let retry = RetryConfig::default();
    loop {
        match client.claim().await {
            Ok(Some(claimed)) => {
                let job_id = claimed.job.id;
                if let Err(e) = run_job(client, registry, cfg, &retry, claimed).await {
                    warn!(job_id = %job_id, error = %e, "job run interrupted");
                    tokio::time::sleep(cfg.poll_interval).await;
                }
            }
            Ok(None) => tokio::time::sleep(cfg.poll_interval).await,
            Err(e) => {
                warn!(error = %e, "claim failed");
                tokio::time::sleep(cfg.poll_interval).await;
            }
        }
    }
}
