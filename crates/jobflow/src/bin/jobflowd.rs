use std::sync::Arc;

use jobflow::api;
use jobflow::clock::SystemClock;
use jobflow::config::Config;
use jobflow::db;
use jobflow::jobs::processors::demo_registry;
use jobflow::jobs::{JobManager, JobStore, ManagerSettings, PgJobStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::from_env()?;
    let api_addr = cfg.admin_addr.clone();

    info!(
        api = api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        lease_seconds = cfg.lease_seconds,
        stuck_threshold_secs = cfg.stuck_threshold_secs,
        watchdog_interval_secs = cfg.watchdog_interval_secs,
        max_concurrency = cfg.max_concurrency,
        "jobflowd starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = PgJobStore::new(pool);
    let unfinished = store.unfinished_in_process_jobs().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let manager = Arc::new(JobManager::new(
        store,
        demo_registry(),
        Arc::new(SystemClock),
        ManagerSettings::from_config(&cfg),
    ));

    // pick up in-process jobs a previous run left behind; their handles are detached
    if !unfinished.is_empty() {
        info!(jobs = unfinished.len(), "re-dispatching unfinished jobs");
    }
    for job in unfinished {
        manager.dispatch(job.id);
    }

    // ---- Watchdog task ----
    let watchdog_handle = manager.watchdog().clone().spawn(cfg.watchdog_interval());

    // ---- API task ----
    let app = api::router(api::ApiState {
        manager: manager.clone(),
        defaults: cfg.job_defaults.clone(),
    });
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(addr = %addr, "api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        res = watchdog_handle => res??,
    }

    Ok(())
}
