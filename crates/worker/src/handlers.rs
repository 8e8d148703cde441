use jobflow::jobs::model::WorkItem;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};
use tokio::time::timeout;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
type HandlerFn = dyn for<'a> Fn(&'a WorkItem, &'a ItemContext) -> BoxFuture<'a, Result<ItemResult, ItemError>>
    + Send
    + Sync;

#[derive(Debug)]
pub struct ItemError {
    pub code: &'static str,
    pub message: String,
}

impl ItemError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    Done(Option<Value>),
    Skipped(String),
}

/// Per-job data every handler sees.
#[derive(Clone)]
pub struct ItemContext {
    pub worker_id: String,
    pub job_id: uuid::Uuid,
    pub config: Value,
}

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    timeout: Option<Duration>,
}

impl HandlerEntry {
    pub async fn run(&self, item: &WorkItem, ctx: &ItemContext) -> Result<ItemResult, ItemError> {
        let fut = (self.handler)(item, ctx);
        let Some(limit) = self.timeout else {
            return fut.await;
        };
        timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(ItemError::new(
                "TIMEOUT",
                format!("handler timeout after {}ms", limit.as_millis()),
            ))
        })
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`; `timeout` bounds each call.
    pub fn register<F>(&mut self, job_type: &str, timeout: Option<Duration>, handler: F)
    where
        F: for<'a> Fn(&'a WorkItem, &'a ItemContext) -> BoxFuture<'a, Result<ItemResult, ItemError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                timeout,
            },
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }
}

#[derive(Deserialize)]
struct TrainStepInput {
    epoch: u32,
    #[serde(default)]
    shard: Option<String>,
}

fn parse_input<T: for<'de> Deserialize<'de>>(item: &WorkItem) -> Result<T, ItemError> {
    serde_json::from_value(item.input.clone()).map_err(|e| ItemError::new("BAD_INPUT", e.to_string()))
}

pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.register(
        "train_step",
        Some(Duration::from_secs(600)),
        |item, ctx| {
            boxed(async move {
                let input: TrainStepInput = parse_input(item)?;
                let step_ms = ctx
                    .config
                    .get("step_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(500);
                tokio::time::sleep(Duration::from_millis(step_ms)).await;
                Ok(ItemResult::Done(Some(json!({
                    "epoch": input.epoch,
                    "shard": input.shard,
                    "trained_by": ctx.worker_id,
                }))))
            })
        },
    );
    registry.register("noop", None, |_item, _ctx| {
        boxed(async move { Ok(ItemResult::Done(None)) })
    });
    registry.register(
        "fail_me",
        Some(Duration::from_secs(5)),
        |_item, _ctx| {
            boxed(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(ItemError::new("UNPROCESSABLE", "simulated failure"))
            })
        },
    );

    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow::jobs::model::ItemStatus;

    fn item(input: Value) -> WorkItem {
        WorkItem {
            id: uuid::Uuid::new_v4(),
            job_id: uuid::Uuid::new_v4(),
            seq: 0,
            input,
            status: ItemStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            output: None,
            skip_reason: None,
            error_code: None,
            error_detail: None,
            last_error_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn ctx(config: Value) -> ItemContext {
        ItemContext {
            worker_id: "gpu-0".into(),
            job_id: uuid::Uuid::new_v4(),
            config,
        }
    }

    #[tokio::test]
    async fn train_step_reports_its_epoch() {
        let registry = build_registry();
        let entry = registry.handler_for("train_step").unwrap();
        let out = entry
            .run(&item(json!({ "epoch": 4 })), &ctx(json!({ "step_ms": 1 })))
            .await
            .unwrap();
        assert_eq!(
            out,
            ItemResult::Done(Some(json!({ "epoch": 4, "shard": null, "trained_by": "gpu-0" })))
        );
    }

    #[tokio::test]
    async fn malformed_input_is_bad_input() {
        let registry = build_registry();
        let entry = registry.handler_for("train_step").unwrap();
        let err = entry
            .run(&item(json!({ "shard": "a" })), &ctx(json!({ "step_ms": 1 })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "BAD_INPUT");
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let mut registry = HandlerRegistry::new();
        registry.register("slow", Some(Duration::from_millis(20)), |_item, _ctx| {
            boxed(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ItemResult::Done(None))
            })
        });
        let entry = registry.handler_for("slow").unwrap();
        let err = entry.run(&item(json!({})), &ctx(json!({}))).await.unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
        assert!(registry.handler_for("missing").is_none());
    }
}
