use std::env;
use std::sync::Arc;

use anyhow::Context;
use jobflow::clock::SystemClock;
use jobflow::config::{env_or_fallback, Config};
use jobflow::db;
use jobflow::jobs::processors::demo_registry;
use jobflow::jobs::{JobFilter, JobManager, JobStatus, JobStore, ManagerSettings, PgJobStore};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const USAGE: &str = "jobflowctl <command>\n\
Commands:\n\
- list [status]\n\
- status <job_id>\n\
- errors <job_id>\n\
- resume <job_id>            (runs the job here until it finishes)\n\
- reprocess <job_id>         (runs the reset items here until they finish)\n\
- cancel <job_id>\n\
- archive <job_id>\n\
- sweep\n\
- register-worker <worker_id> <token>\n\
- deactivate-worker <worker_id>\n\
- migrate\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprint!("{USAGE}");
        std::process::exit(2);
    }

    dotenvy::dotenv().ok();
    let url = env_or_fallback("DATABASE_URL", "TEST_DATABASE_URL")
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;
    let pool = db::make_pool(&url).await?;

    if args[1] == "migrate" {
        db::run_migrations(&pool).await?;
        println!("migrations OK");
        return Ok(());
    }

    // thresholds follow the daemon's settings when they are present
    let settings = Config::from_env()
        .map(|cfg| ManagerSettings::from_config(&cfg))
        .unwrap_or_default();
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let manager = JobManager::new(store, demo_registry(), Arc::new(SystemClock), settings);

    match args[1].as_str() {
        "list" => {
            let status = match args.get(2) {
                Some(raw) => Some(
                    JobStatus::parse(raw).with_context(|| format!("unknown status: {raw}"))?,
                ),
                None => None,
            };
            let jobs = manager
                .list_jobs(&JobFilter {
                    status,
                    ..JobFilter::default()
                })
                .await?;
            for job in jobs {
                println!(
                    "{} {:<11} type={} processed={}/{} errors={} retries={}/{}",
                    job.id,
                    job.status,
                    job.job_type,
                    job.processed_count(),
                    job.total_items,
                    job.error_count,
                    job.retry_count,
                    job.max_retries
                );
            }
        }
        "status" => {
            let view = manager.get_status(job_arg(&args)?).await?;
            print_json(&view)?;
        }
        "errors" => {
            let errors = manager.list_errors(job_arg(&args)?).await?;
            if errors.is_empty() {
                println!("no errored items");
            }
            for e in errors {
                println!(
                    "#{} item={} attempts={}/{} code={} at={}\n    detail: {}\n    action: {}",
                    e.seq,
                    e.item_id,
                    e.attempts,
                    e.max_attempts,
                    e.error_code.as_deref().unwrap_or("-"),
                    e.last_error_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    e.error_detail.as_deref().unwrap_or("-"),
                    e.suggested_action
                );
            }
        }
        "resume" => {
            let (outcome, dispatch) = manager.resume(job_arg(&args)?).await?;
            print_json(&outcome)?;
            if let Some(dispatch) = dispatch {
                let job = dispatch.wait().await?;
                println!("finished: status={} processed={}/{}", job.status, job.processed_count(), job.total_items);
            }
        }
        "reprocess" => {
            let (outcome, dispatch) = manager.reprocess_errors(job_arg(&args)?).await?;
            println!("reset {} item(s)", outcome.reset);
            if let Some(dispatch) = dispatch {
                let job = dispatch.wait().await?;
                println!("finished: status={} errors={}", job.status, job.error_count);
            }
        }
        "cancel" => {
            let job = manager.cancel(job_arg(&args)?).await?;
            println!("cancelled job {} (draining={})", job.id, job.finished_at.is_none());
        }
        "archive" => {
            let job = manager.archive(job_arg(&args)?).await?;
            println!("archived job {}", job.id);
        }
        "sweep" => {
            let report = manager.run_watchdog_sweep().await?;
            print_json(&report)?;
        }
        "register-worker" => {
            let (Some(worker_id), Some(token)) = (args.get(2), args.get(3)) else {
                anyhow::bail!("usage: jobflowctl register-worker <worker_id> <token>");
            };
            let worker = manager.workers().register(worker_id, token).await?;
            println!("registered worker {}", worker.id);
        }
        "deactivate-worker" => {
            let worker_id = args
                .get(2)
                .context("usage: jobflowctl deactivate-worker <worker_id>")?;
            let worker = manager.workers().deactivate(worker_id).await?;
            println!("deactivated worker {}", worker.id);
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn job_arg(args: &[String]) -> anyhow::Result<Uuid> {
    let raw = args.get(2).context("missing <job_id>")?;
    raw.parse()
        .with_context(|| format!("invalid job id: {raw}"))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
