use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{ItemCompletion, ItemFailure, WorkItem};
use crate::jobs::processor::{ItemProcessor, ProcessorRegistry};

/// Labels a document by keyword. Blank documents are skipped, not failed.
pub struct ClassifyDocument;

#[derive(Deserialize)]
struct DocumentInput {
    text: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize, Default)]
struct ClassifyConfig {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    fallback: Option<String>,
}

#[async_trait]
impl ItemProcessor for ClassifyDocument {
    async fn process(&self, item: &WorkItem, config: &Value) -> Result<ItemCompletion, ItemFailure> {
        let doc: DocumentInput = serde_json::from_value(item.input.clone())
            .map_err(|e| ItemFailure::permanent(ErrorCode::BadInput.as_str(), e.to_string()))?;
        let cfg: ClassifyConfig = serde_json::from_value(config.clone()).unwrap_or_default();

        let text = doc.text.trim().to_lowercase();
        if text.is_empty() {
            return Ok(ItemCompletion::Skipped {
                reason: "empty document".into(),
            });
        }

        let label = cfg
            .labels
            .iter()
            .find(|label| text.contains(&label.to_lowercase()))
            .cloned()
            .or(cfg.fallback)
            .unwrap_or_else(|| "unlabelled".to_string());

        Ok(ItemCompletion::Done {
            output: Some(json!({
                "name": doc.name,
                "label": label,
                "chars": text.chars().count(),
            })),
        })
    }
}

/// Sleeps for `config.sleep_ms` (default 100) and succeeds. Handy for watching a job run.
pub struct Sleep;

#[async_trait]
impl ItemProcessor for Sleep {
    async fn process(&self, _item: &WorkItem, config: &Value) -> Result<ItemCompletion, ItemFailure> {
        let ms = config.get("sleep_ms").and_then(Value::as_u64).unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ItemCompletion::Done { output: None })
    }
}

pub struct Noop;

#[async_trait]
impl ItemProcessor for Noop {
    async fn process(&self, _item: &WorkItem, _config: &Value) -> Result<ItemCompletion, ItemFailure> {
        Ok(ItemCompletion::Done { output: None })
    }
}

/// Processors jobflowd registers out of the box. Replace with real ones.
pub fn demo_registry() -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register_with_timeout(
        "classify_document",
        Arc::new(ClassifyDocument),
        Duration::from_secs(30),
    );
    registry.register_with_timeout("sleep", Arc::new(Sleep), Duration::from_secs(60));
    registry.register("noop", Arc::new(Noop));
    registry
}
