use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{ItemCompletion, ItemFailure, WorkItem};

/// One unit of work: classify one document, run one training step, ...
///
/// Implementations are supplied per job type. Returning `Err` with a transient failure
/// lets the dispatcher retry the item; a permanent failure moves it straight to ERROR.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem, config: &Value)
        -> Result<ItemCompletion, ItemFailure>;
}

#[derive(Clone)]
pub struct ProcessorEntry {
    pub processor: Arc<dyn ItemProcessor>,
    pub timeout: Option<Duration>,
}

impl ProcessorEntry {
    pub async fn run(&self, item: &WorkItem, config: &Value) -> Result<ItemCompletion, ItemFailure> {
        let fut = self.processor.process(item, config);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(ItemFailure::transient(
                    ErrorCode::Timeout.as_str(),
                    format!("processor timeout after {}ms", dur.as_millis()),
                )),
            },
            None => fut.await,
        }
    }
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, ProcessorEntry>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: &str, processor: Arc<dyn ItemProcessor>) {
        self.processors.insert(
            job_type.to_string(),
            ProcessorEntry {
                processor,
                timeout: None,
            },
        );
    }

    pub fn register_with_timeout(
        &mut self,
        job_type: &str,
        processor: Arc<dyn ItemProcessor>,
        timeout_dur: Duration,
    ) {
        self.processors.insert(
            job_type.to_string(),
            ProcessorEntry {
                processor,
                timeout: Some(timeout_dur),
            },
        );
    }

    pub fn processor_for(&self, job_type: &str) -> Option<&ProcessorEntry> {
        self.processors.get(job_type)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.processors.contains_key(job_type)
    }

    /// Runs the processor registered for `job_type`; unknown types fail permanently.
    pub async fn run(
        &self,
        job_type: &str,
        item: &WorkItem,
        config: &Value,
    ) -> Result<ItemCompletion, ItemFailure> {
        match self.processor_for(job_type) {
            Some(entry) => entry.run(item, config).await,
            None => Err(ItemFailure::permanent(
                ErrorCode::UnknownJobType.as_str(),
                format!("no processor for job_type={job_type}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::tests_support::sample_item;
    use crate::jobs::model::FailureKind;
    use serde_json::json;

    struct Sleepy(Duration);

    #[async_trait]
    impl ItemProcessor for Sleepy {
        async fn process(
            &self,
            _item: &WorkItem,
            _config: &Value,
        ) -> Result<ItemCompletion, ItemFailure> {
            tokio::time::sleep(self.0).await;
            Ok(ItemCompletion::Done { output: None })
        }
    }

    #[tokio::test]
    async fn unknown_job_type_fails_permanently() {
        let registry = ProcessorRegistry::new();
        let err = registry
            .run("nope", &sample_item(), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.code, "UNKNOWN_JOB_TYPE");
    }

    #[tokio::test]
    async fn timeout_is_a_transient_failure() {
        let mut registry = ProcessorRegistry::new();
        registry.register_with_timeout(
            "slow",
            Arc::new(Sleepy(Duration::from_secs(5))),
            Duration::from_millis(20),
        );
        registry.register("fast", Arc::new(Sleepy(Duration::ZERO)));

        let err = registry
            .run("slow", &sample_item(), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.code, "TIMEOUT");

        assert!(registry.run("fast", &sample_item(), &json!({})).await.is_ok());
    }
}
