use std::time::Duration;

use jobflow::config::env_or_fallback;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub server_url: String,
    pub worker_id: String,
    pub token: String,
    pub poll_interval: Duration,
    /// Flush item reports after this many items.
    pub heartbeat_every: usize,
    /// Heartbeat at least this often while an item runs.
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let server_url = env_or_fallback("JOBFLOW_SERVER_URL", "SERVER_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let worker_id = env_or_fallback("JOBFLOW_WORKER_ID", "WORKER_ID")
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        let token = env_or_fallback("JOBFLOW_WORKER_TOKEN", "WORKER_TOKEN")
            .ok_or_else(|| anyhow::anyhow!("JOBFLOW_WORKER_TOKEN is missing"))?;

        let poll_interval_ms: u64 = env_or_fallback("JOBFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let heartbeat_every: usize = env_or_fallback("JOBFLOW_HEARTBEAT_EVERY", "HEARTBEAT_EVERY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let heartbeat_interval_secs: u64 =
            env_or_fallback("JOBFLOW_HEARTBEAT_INTERVAL_SECS", "HEARTBEAT_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(15);

        Ok(Self {
            server_url,
            worker_id,
            token,
            poll_interval: Duration::from_millis(poll_interval_ms.max(50)),
            heartbeat_every: heartbeat_every.max(1),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs.max(1)),
        })
    }
}
