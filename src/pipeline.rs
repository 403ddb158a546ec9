//! Staged transformation pipeline.
//!
//! Items flow through an ordered chain of stages connected by bounded
//! channels. Each stage owns its input receiver and output sender; when a
//! stage fails, dropping its endpoints unwinds the chain (upstream sends fail,
//! downstream receives end) without a separate cancellation signal. A stage
//! whose output closes must drain quietly and return `Ok`, so only the stage
//! that actually failed records an error.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// A single pipeline stage.
///
/// `run` consumes items from `input` and forwards transformed items to
/// `output`. Returning `Err` aborts the run; a send error on `output` means a
/// later stage already failed, and the stage should stop and return `Ok`.
#[async_trait]
pub trait Stage<T: Send + 'static>: Send + Sync {
    /// Stage name used in logs.
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Process the stream until `input` closes or an error occurs.
    async fn run(&self, input: mpsc::Receiver<T>, output: mpsc::Sender<T>) -> Result<()>;
}

/// Adapter that lifts an async closure over the raw channel pair into a
/// [`Stage`], for stages that filter, expand, or buffer rather than map
/// one-to-one.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Stage<T> for FnStage<F>
where
    T: Send + 'static,
    F: Fn(mpsc::Receiver<T>, mpsc::Sender<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: mpsc::Receiver<T>, output: mpsc::Sender<T>) -> Result<()> {
        (self.f)(input, output).await
    }
}

/// Adapter for the common one-in one-out case: applies a synchronous function
/// to every item.
pub struct MapStage<M> {
    name: String,
    map: M,
}

impl<M> MapStage<M> {
    pub fn new(name: impl Into<String>, map: M) -> Self {
        Self {
            name: name.into(),
            map,
        }
    }
}

#[async_trait]
impl<T, M> Stage<T> for MapStage<M>
where
    T: Send + 'static,
    M: Fn(T) -> T + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut input: mpsc::Receiver<T>, output: mpsc::Sender<T>) -> Result<()> {
        while let Some(item) = input.recv().await {
            if output.send((self.map)(item)).await.is_err() {
                // Downstream hung up; the run is being torn down.
                break;
            }
        }
        Ok(())
    }
}

/// An ordered chain of stages applied to a sequence of items.
pub struct Pipeline<T> {
    stages: Vec<Arc<dyn Stage<T>>>,
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage to the end of the chain.
    pub fn add_stage<S>(&mut self, stage: S) -> &mut Self
    where
        S: Stage<T> + 'static,
    {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Number of stages in the chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `items` through every stage in order and collect the final output.
    ///
    /// With no stages the input is returned unchanged. `buffer` sets the
    /// capacity of each inter-stage channel (clamped to at least 1), so all
    /// stages work concurrently on different items while memory stays
    /// bounded. If any stage fails, the first error in order of occurrence is
    /// returned after every stage task has settled.
    ///
    /// Output order is not guaranteed in general: it follows whatever order
    /// each stage emits in. The built-in [`MapStage`] forwards items one at a
    /// time in arrival order, so chains of such stages preserve input order,
    /// but a custom stage is free to buffer, reorder, or regroup the stream.
    #[instrument(skip(self, items), fields(stages = self.stages.len(), items = items.len()))]
    pub async fn process(&self, items: Vec<T>, buffer: usize) -> Result<Vec<T>> {
        if self.stages.is_empty() {
            return Ok(items);
        }

        let buffer = buffer.max(1);
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let (feed_tx, mut next_rx) = mpsc::channel(buffer);
        let feeder = tokio::spawn(async move {
            for item in items {
                if feed_tx.send(item).await.is_err() {
                    // The first stage hung up early; the error slot says why.
                    break;
                }
            }
        });

        let mut handles = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let (tx, rx) = mpsc::channel(buffer);
            let input = std::mem::replace(&mut next_rx, rx);
            let stage = Arc::clone(stage);
            let slot = Arc::clone(&first_error);
            handles.push(tokio::spawn(async move {
                if let Err(err) = stage.run(input, tx).await {
                    warn!(stage = stage.name(), error = %err, "stage failed");
                    let mut slot = slot.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            }));
        }

        // Drain the tail before joining so no stage is left blocked on a
        // full channel.
        let output: Vec<T> = ReceiverStream::new(next_rx).collect().await;

        feeder.await?;
        for handle in handles {
            handle.await?;
        }

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        debug!(output = output.len(), "pipeline complete");
        Ok(output)
    }
}

impl<T> Default for Pipeline<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
