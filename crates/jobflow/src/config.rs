use std::time::Duration;

// Runtime configuration for jobflowd and jobflowctl, read from the environment
// (a .env file is honoured when present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,

    pub lease_seconds: i64,
    pub stuck_threshold_secs: i64,
    pub watchdog_interval_secs: u64,
    pub max_concurrency: usize,

    pub job_defaults: JobDefaults,
}

/// Applied when a create request leaves a limit unset.
#[derive(Clone, Debug)]
pub struct JobDefaults {
    pub max_attempts: i32,
    pub max_retries: i32,
    pub max_reprocess_cycles: i32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_retries: 3,
            max_reprocess_cycles: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let admin_addr = env_or_fallback("JOBFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("JOBFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let lease_seconds = env_or_fallback("JOBFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let stuck_threshold_secs =
            env_or_fallback("JOBFLOW_STUCK_THRESHOLD_SECS", "STUCK_THRESHOLD_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(300);

        let watchdog_interval_secs =
            env_or_fallback("JOBFLOW_WATCHDOG_INTERVAL_SECS", "WATCHDOG_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

        let max_concurrency = env_or_fallback("JOBFLOW_MAX_CONCURRENCY", "MAX_CONCURRENCY")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(20)
            .max(1);

        let defaults = JobDefaults::default();
        let job_defaults = JobDefaults {
            max_attempts: env_i32("JOBFLOW_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            max_retries: env_i32("JOBFLOW_MAX_RETRIES").unwrap_or(defaults.max_retries),
            max_reprocess_cycles: env_i32("JOBFLOW_MAX_REPROCESS_CYCLES")
                .unwrap_or(defaults.max_reprocess_cycles),
        };

        if lease_seconds <= 0 {
            anyhow::bail!("JOBFLOW_LEASE_SECONDS must be > 0");
        }
        if stuck_threshold_secs <= 0 {
            anyhow::bail!("JOBFLOW_STUCK_THRESHOLD_SECS must be > 0");
        }

        Ok(Self {
            database_url,
            admin_addr,
            migrate_on_startup,
            lease_seconds,
            stuck_threshold_secs,
            watchdog_interval_secs,
            max_concurrency,
            job_defaults,
        })
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }
}

pub fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_i32(key: &str) -> Option<i32> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|n: &i32| *n > 0)
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_addr_values_normalize_to_none() {
        assert_eq!(normalize_optional_addr("  "), None);
        assert_eq!(normalize_optional_addr("off"), None);
        assert_eq!(normalize_optional_addr("NONE"), None);
        assert_eq!(
            normalize_optional_addr(" 0.0.0.0:8080 "),
            Some("0.0.0.0:8080".to_string())
        );
    }
}
