//! Handler trait, the job-type registry, and built-in handlers.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::job::{Job, JobError};

/// Implemented once per job type; decodes the payload and performs the work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler serves.
    fn job_type(&self) -> &str;

    /// Run one attempt.
    ///
    /// Retryable errors consume the job's retry budget; fatal errors fail the
    /// job on the spot. A panic is caught by the pool and fails the job
    /// fatally without taking the worker down.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Job-type to handler map. Populated before the pool starts and frozen from
/// then on.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Re-registering a job type replaces the previous
    /// handler.
    pub fn register<H>(&mut self, handler: H)
    where
        H: JobHandler + 'static,
    {
        let job_type = handler.job_type().to_string();
        debug!(%job_type, "registered job handler");
        self.handlers.insert(job_type, Arc::new(handler));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered job types, sorted for stable log output.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Handler that accepts any payload and succeeds immediately. Useful as a
/// liveness check and in tests.
#[derive(Debug, Default)]
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> &str {
        "noop"
    }

    async fn handle(&self, _job: &Job) -> Result<(), JobError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SleepPayload {
    #[serde(with = "humantime_serde")]
    duration: Duration,
}

/// Handler that sleeps for the duration named in the payload, e.g.
/// `{"duration": "250ms"}`. Stands in for slow work in tests and load drills.
#[derive(Debug, Default)]
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    fn job_type(&self) -> &str {
        "sleep"
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: SleepPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::fatal(format!("invalid sleep payload: {err}")))?;
        tokio::time::sleep(payload.duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(NoOpHandler);
        registry.register(SleepHandler);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.job_types(), vec!["noop", "sleep"]);
    }

    #[tokio::test]
    async fn test_reregistering_replaces() {
        struct TaggedNoOp(&'static str);

        #[async_trait]
        impl JobHandler for TaggedNoOp {
            fn job_type(&self) -> &str {
                "noop"
            }

            async fn handle(&self, _job: &Job) -> Result<(), JobError> {
                Err(JobError::fatal(self.0))
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register(TaggedNoOp("first"));
        registry.register(TaggedNoOp("second"));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("noop").unwrap();
        let err = handler.handle(&Job::new("noop", json!({}))).await.unwrap_err();
        assert_eq!(err.message(), "second");
    }

    #[tokio::test]
    async fn test_noop_accepts_any_payload() {
        let job = Job::new("noop", json!({"anything": [1, 2, 3]}));
        assert!(NoOpHandler.handle(&job).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_handler_sleeps_for_payload_duration() {
        let job = Job::new("sleep", json!({"duration": "2s"}));
        let started = tokio::time::Instant::now();
        SleepHandler.handle(&job).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_sleep_handler_rejects_bad_payload() {
        let job = Job::new("sleep", json!({"duration": 12}));
        let err = SleepHandler.handle(&job).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
