#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::Semaphore;
use uuid::Uuid;

use jobflow::clock::ManualClock;
use jobflow::jobs::retry::RetryConfig;
use jobflow::jobs::{
    DispatchSettings, ItemCompletion, ItemFailure, ItemProcessor, ItemStatus, JobManager,
    JobStore, ManagerSettings, MemoryJobStore, ProcessorRegistry, WorkItem,
};

pub const JOB_TYPE: &str = "scripted";

/// What the scripted processor does on one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(ItemFailure),
    /// Never returns, like a process that died mid-item.
    Hang,
    /// Blocks until the test opens the gate, then succeeds.
    Gate,
    /// Blocks on the gate, then fails.
    GateThenFail(ItemFailure),
}

/// Item processor driven by a per-item script keyed by `seq`. Records every attempt.
pub struct Scripted {
    script: Mutex<HashMap<i32, VecDeque<Step>>>,
    default_step: Step,
    delay: Option<StdDuration>,
    gate: Semaphore,
    started: Mutex<Vec<i32>>,
    succeeded: Mutex<Vec<i32>>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::with_default(Step::Succeed)
    }

    pub fn with_default(default_step: Step) -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            default_step,
            delay: None,
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            succeeded: Mutex::new(Vec::new()),
        }
    }

    /// Every attempt sleeps first; widens race windows.
    pub fn delayed(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(self, seq: i32, steps: Vec<Step>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(seq, steps.into_iter().collect());
        self
    }

    pub fn open_gate(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<i32> {
        self.started.lock().unwrap().clone()
    }

    pub fn succeeded(&self) -> Vec<i32> {
        let mut seqs = self.succeeded.lock().unwrap().clone();
        seqs.sort_unstable();
        seqs
    }

    fn next_step(&self, seq: i32) -> Step {
        self.script
            .lock()
            .unwrap()
            .get_mut(&seq)
            .and_then(|steps| steps.pop_front())
            .unwrap_or_else(|| self.default_step.clone())
    }

    fn done(&self, seq: i32) -> Result<ItemCompletion, ItemFailure> {
        self.succeeded.lock().unwrap().push(seq);
        Ok(ItemCompletion::Done {
            output: Some(json!({ "seq": seq })),
        })
    }
}

#[async_trait]
impl ItemProcessor for Scripted {
    async fn process(&self, item: &WorkItem, _config: &Value) -> Result<ItemCompletion, ItemFailure> {
        self.started.lock().unwrap().push(item.seq);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_step(item.seq) {
            Step::Succeed => self.done(item.seq),
            Step::Fail(failure) => Err(failure),
            Step::Hang => std::future::pending().await,
            Step::Gate => {
                self.gate.acquire().await.unwrap().forget();
                self.done(item.seq)
            }
            Step::GateThenFail(failure) => {
                self.gate.acquire().await.unwrap().forget();
                Err(failure)
            }
        }
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn items(n: usize) -> Vec<Value> {
    (1..=n).map(|i| json!({ "doc": format!("doc-{i}") })).collect()
}

pub struct Harness {
    pub store: MemoryJobStore,
    pub clock: ManualClock,
    pub manager: JobManager,
    pub processor: Arc<Scripted>,
}

/// Memory store, simulated clock, 5 minute stuck threshold, no retry backoff.
pub fn harness(processor: Scripted, max_concurrency: usize) -> Harness {
    let store = MemoryJobStore::new();
    let clock = ManualClock::new(t0());
    let processor = Arc::new(processor);
    let manager = build_manager(
        Arc::new(store.clone()),
        &clock,
        processor.clone(),
        max_concurrency,
    );

    Harness {
        store,
        clock,
        manager,
        processor,
    }
}

/// Manager over any store with the scripted processor registered as `JOB_TYPE`.
pub fn build_manager(
    store: Arc<dyn JobStore>,
    clock: &ManualClock,
    processor: Arc<Scripted>,
    max_concurrency: usize,
) -> JobManager {
    let mut registry = ProcessorRegistry::new();
    registry.register(JOB_TYPE, processor);

    JobManager::new(
        store,
        registry,
        Arc::new(clock.clone()),
        ManagerSettings {
            dispatch: DispatchSettings {
                max_concurrency,
                retry: RetryConfig::immediate(),
            },
            stuck_threshold: Duration::minutes(5),
            lease: Duration::seconds(60),
        },
    )
}

/// Polls until `n` attempts have started.
pub async fn wait_for_started(processor: &Scripted, n: usize) {
    for _ in 0..500 {
        if processor.started().len() >= n {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {n} started attempts; saw {:?}",
        processor.started()
    );
}

pub async fn items_in(store: &dyn JobStore, job_id: Uuid, status: ItemStatus) -> Vec<WorkItem> {
    store.list_items(job_id, Some(status)).await.unwrap()
}

pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    jobflow::db::run_migrations(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE work_items, jobs, workers RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
