//! Bounded-concurrency batch executor.
//!
//! Splits an input sequence into fixed-size batches and runs a caller-supplied
//! async function over them, holding simultaneous invocations under a
//! semaphore admission gate. Failures never cancel sibling batches; every
//! batch runs to completion and the first error in batch-index order is
//! returned.

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Batch executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum items per batch; the last batch may be smaller.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum batches in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout applied to each batch invocation.
    #[serde(with = "humantime_serde", default = "default_batch_timeout")]
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            batch_timeout: default_batch_timeout(),
        }
    }
}

impl BatchConfig {
    /// Set the batch size (clamped to at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the concurrency cap (clamped to at least 1).
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Set the per-batch timeout.
    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }
}

// Default value functions
fn default_batch_size() -> usize {
    50
}

fn default_max_concurrency() -> usize {
    4
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(30)
}

type BatchFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs an async function over fixed-size chunks of an input sequence with
/// bounded fan-out.
///
/// The processing function is fixed at construction; callers that need
/// per-batch outcomes report them through a side channel of their own.
pub struct BatchExecutor<T> {
    config: BatchConfig,
    handler: BatchFn<T>,
}

impl<T> BatchExecutor<T>
where
    T: Send + 'static,
{
    /// Create an executor around `handler`.
    pub fn new<F, Fut>(config: BatchConfig, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            config,
            handler: Arc::new(move |batch| handler(batch).boxed()),
        }
    }

    /// The executor configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Split `items` into batches and run them all.
    ///
    /// Empty input returns immediately. On failures the first error by batch
    /// index is returned once every batch has finished; a batch that outruns
    /// the timeout fails with [`Error::BatchTimeout`] and its future is
    /// dropped.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn process(&self, items: Vec<T>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let batches = split_batches(items, self.config.batch_size);
        let total = batches.len();
        debug!(batches = total, "processing batches");

        let gate = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let timeout = self.config.batch_timeout;

        let mut handles = Vec::with_capacity(total);
        for (index, batch) in batches.into_iter().enumerate() {
            let gate = Arc::clone(&gate);
            let handler = Arc::clone(&self.handler);
            handles.push(tokio::spawn(async move {
                let result = match gate.acquire_owned().await {
                    Ok(_permit) => match tokio::time::timeout(timeout, handler(batch)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::BatchTimeout { index, timeout }),
                    },
                    Err(_) => Err(Error::internal("batch admission gate closed")),
                };
                (index, result)
            }));
        }

        let mut first_error: Option<(usize, Error)> = None;
        for handle in handles {
            let (index, result) = handle.await?;
            match result {
                Ok(()) => {
                    counter!("taskmill_batches_total", "status" => "succeeded").increment(1);
                }
                Err(err) => {
                    warn!(batch = index, error = %err, "batch failed");
                    counter!("taskmill_batches_total", "status" => "failed").increment(1);
                    if first_error.as_ref().map_or(true, |(i, _)| index < *i) {
                        first_error = Some((index, err));
                    }
                }
            }
        }

        match first_error {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

/// Chunk `items` into batches of at most `batch_size`, preserving order.
fn split_batches<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter();
    loop {
        let batch: Vec<T> = items.by_ref().take(size).collect();
        if batch.is_empty() {
            break;
        }
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_config_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.batch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builders_clamp() {
        let config = BatchConfig::default()
            .with_batch_size(0)
            .with_max_concurrency(0)
            .with_batch_timeout(Duration::from_millis(250));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_split_batches_exact_and_remainder() {
        let batches = split_batches((0..10).collect(), 5);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(batches[1], vec![5, 6, 7, 8, 9]);

        let batches = split_batches((0..11).collect(), 5);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![10]);
    }

    #[test]
    fn test_split_batches_never_exceeds_size() {
        let batches = split_batches((0..37).collect::<Vec<u32>>(), 4);
        assert!(batches.iter().all(|b| b.len() <= 4));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 37);
    }

    #[tokio::test]
    async fn test_empty_input_is_immediate_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let executor = BatchExecutor::new(BatchConfig::default(), move |_batch: Vec<u32>| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(executor.process(Vec::new()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_items_processed() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let executor = BatchExecutor::new(
            BatchConfig::default().with_batch_size(3),
            move |batch: Vec<u32>| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        executor.process((0..10).collect()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_fails_that_batch() {
        let executor = BatchExecutor::new(
            BatchConfig::default()
                .with_batch_size(2)
                .with_batch_timeout(Duration::from_millis(100)),
            |batch: Vec<u32>| async move {
                if batch.contains(&0) {
                    // Never finishes; the timeout reaps it.
                    std::future::pending::<()>().await;
                }
                Ok(())
            },
        );

        let err = executor.process(vec![0, 1, 2, 3]).await.unwrap_err();
        match err {
            Error::BatchTimeout { index, .. } => assert_eq!(index, 0),
            other => panic!("expected timeout, got {other}"),
        }
    }
}
