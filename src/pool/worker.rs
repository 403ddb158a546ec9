//! The worker pool: bounded admission, worker loop, retry timers, and result
//! fan-out.

use dashmap::DashMap;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::handler::{HandlerRegistry, JobHandler};
use super::job::{BackoffStrategy, Job, JobError, JobId, JobResult};
use crate::error::{Error, Result};

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound of the job queue; submissions beyond it are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound of the results channel feeding the drain task.
    #[serde(default = "default_result_capacity")]
    pub result_capacity: usize,

    /// Timeout applied to each job attempt.
    #[serde(with = "humantime_serde", default = "default_job_timeout")]
    pub job_timeout: Duration,

    /// Delay schedule between retry attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Pool name used in logs.
    #[serde(default = "default_pool_name")]
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            result_capacity: default_result_capacity(),
            job_timeout: default_job_timeout(),
            backoff: BackoffStrategy::default(),
            name: default_pool_name(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_result_capacity(mut self, result_capacity: usize) -> Self {
        self.result_capacity = result_capacity;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Clamp sizes so channels are always constructible.
    fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.result_capacity = self.result_capacity.max(1);
        self
    }
}

// Default value functions
fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

fn default_result_capacity() -> usize {
    100
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pool_name() -> String {
    "default".to_string()
}

/// Lifetime counters shared between the pool handle and its workers.
#[derive(Debug, Clone, Default)]
struct PoolCounters {
    submitted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    succeeded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    retried: Arc<AtomicU64>,
    dropped_jobs: Arc<AtomicU64>,
    dropped_results: Arc<AtomicU64>,
}

/// Point-in-time snapshot of a pool's state and lifetime counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Configured worker count
    pub worker_count: usize,
    /// Configured queue bound
    pub queue_capacity: usize,
    /// Jobs waiting in the queue right now
    pub queued_jobs: usize,
    /// Results waiting for the drain task right now
    pub pending_results: usize,
    /// Retry timers currently armed
    pub pending_retries: usize,
    /// Submissions accepted (lifetime)
    pub submitted: u64,
    /// Submissions rejected with a full queue (lifetime)
    pub rejected: u64,
    /// Jobs that ended in success (lifetime)
    pub succeeded: u64,
    /// Jobs that ended in terminal failure (lifetime)
    pub failed: u64,
    /// Retry attempts scheduled (lifetime)
    pub retried: u64,
    /// Retry re-submissions dropped on a full queue (lifetime)
    pub dropped_jobs: u64,
    /// Results dropped on a full results channel (lifetime)
    pub dropped_results: u64,
}

impl PoolStats {
    /// Share of completed jobs that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Idle,
    Running,
    Closed,
}

/// Everything a worker task needs, cloned once per worker.
#[derive(Clone)]
struct WorkerContext {
    worker_id: usize,
    pool: String,
    config: PoolConfig,
    registry: Arc<HandlerRegistry>,
    job_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    job_tx: mpsc::Sender<Job>,
    result_tx: mpsc::Sender<JobResult>,
    retry_timers: Arc<DashMap<JobId, JoinHandle<()>>>,
    counters: PoolCounters,
    shutdown_rx: watch::Receiver<bool>,
}

/// A pool of worker tasks that drain a bounded job queue.
///
/// Lifecycle is one-shot: register handlers, `start`, submit jobs, `stop`.
/// A stopped pool stays closed. Jobs submitted before `start` wait in the
/// queue; jobs still queued at `stop` are discarded. Every job that runs to
/// its terminal outcome produces exactly one [`JobResult`], fanned out to
/// subscribers.
pub struct WorkerPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    registry: Mutex<HandlerRegistry>,
    job_tx: mpsc::Sender<Job>,
    job_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    result_tx: Mutex<Option<mpsc::Sender<JobResult>>>,
    result_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    broadcast_tx: broadcast::Sender<JobResult>,
    shutdown_tx: watch::Sender<bool>,
    retry_timers: Arc<DashMap<JobId, JoinHandle<()>>>,
    counters: PoolCounters,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool. No tasks run until [`start`](Self::start).
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalized();
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.result_capacity);
        let (broadcast_tx, _) = broadcast::channel(config.result_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "worker pool created"
        );

        Self {
            config,
            state: Mutex::new(PoolState::Idle),
            registry: Mutex::new(HandlerRegistry::new()),
            job_tx,
            job_rx: Arc::new(AsyncMutex::new(job_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            broadcast_tx,
            shutdown_tx,
            retry_timers: Arc::new(DashMap::new()),
            counters: PoolCounters::default(),
            worker_handles: Mutex::new(Vec::new()),
            drain_handle: Mutex::new(None),
        }
    }

    /// Create a pool with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == PoolState::Running
    }

    /// Register a handler for its job type.
    ///
    /// The registry freezes when the pool starts; registration afterwards is
    /// refused rather than racing the workers.
    pub fn register_handler<H>(&self, handler: H) -> Result<()>
    where
        H: JobHandler + 'static,
    {
        let state = self.state.lock();
        match *state {
            PoolState::Idle => {
                self.registry.lock().register(handler);
                Ok(())
            }
            PoolState::Running => Err(Error::PoolRunning),
            PoolState::Closed => Err(Error::PoolClosed),
        }
    }

    /// Enqueue a job, returning its id.
    ///
    /// Admission is non-blocking: a full queue rejects the submission with
    /// [`Error::QueueFull`] instead of applying backpressure to the caller.
    pub fn submit(&self, job: Job) -> Result<JobId> {
        if *self.state.lock() == PoolState::Closed {
            return Err(Error::PoolClosed);
        }

        let job_id = job.id;
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                counter!("taskmill_jobs_submitted_total").increment(1);
                debug!(pool = %self.config.name, %job_id, "job submitted");
                Ok(job_id)
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pool = %self.config.name,
                    %job_id,
                    capacity = self.config.queue_capacity,
                    "job queue full, rejecting submission"
                );
                Err(Error::QueueFull {
                    capacity: self.config.queue_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(Error::PoolClosed),
        }
    }

    /// Receive terminal job results.
    ///
    /// Each subscriber sees results emitted after it subscribed; a subscriber
    /// that falls behind the channel capacity misses the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<JobResult> {
        self.broadcast_tx.subscribe()
    }

    /// Launch the workers and the result drain task.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            PoolState::Running => return Err(Error::PoolRunning),
            PoolState::Closed => return Err(Error::PoolClosed),
            PoolState::Idle => {}
        }

        // Freeze the registry for the lifetime of the pool.
        let registry = Arc::new(std::mem::take(&mut *self.registry.lock()));
        let result_tx = self
            .result_tx
            .lock()
            .clone()
            .ok_or_else(|| Error::internal("results channel already closed"))?;
        let mut result_rx = self
            .result_rx
            .lock()
            .take()
            .ok_or_else(|| Error::internal("results channel already consumed"))?;

        info!(
            pool = %self.config.name,
            workers = self.config.workers,
            job_types = ?registry.job_types(),
            "worker pool starting"
        );

        let mut handles = self.worker_handles.lock();
        for worker_id in 0..self.config.workers {
            let ctx = WorkerContext {
                worker_id,
                pool: self.config.name.clone(),
                config: self.config.clone(),
                registry: Arc::clone(&registry),
                job_rx: Arc::clone(&self.job_rx),
                job_tx: self.job_tx.clone(),
                result_tx: result_tx.clone(),
                retry_timers: Arc::clone(&self.retry_timers),
                counters: self.counters.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            handles.push(tokio::spawn(Self::worker_loop(ctx)));
        }
        drop(handles);
        drop(result_tx);

        let broadcast_tx = self.broadcast_tx.clone();
        let pool = self.config.name.clone();
        let drain = tokio::spawn(async move {
            while let Some(result) = result_rx.recv().await {
                debug!(
                    pool = %pool,
                    job_id = %result.job_id,
                    success = result.success,
                    attempts = result.attempts,
                    "job completed"
                );
                // No subscribers is fine; the result is simply not observed.
                let _ = broadcast_tx.send(result);
            }
            debug!(pool = %pool, "result drain stopped");
        });
        *self.drain_handle.lock() = Some(drain);

        *state = PoolState::Running;
        Ok(())
    }

    /// Stop the pool gracefully.
    ///
    /// In-flight attempts run to completion and their results are delivered;
    /// armed retry timers are cancelled; jobs still queued are discarded.
    /// Stopping twice is a no-op.
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Closed => {
                    debug!("worker pool already stopped");
                    return Ok(());
                }
                PoolState::Idle => {
                    *state = PoolState::Closed;
                    self.result_tx.lock().take();
                    debug!("worker pool closed before starting");
                    return Ok(());
                }
                PoolState::Running => *state = PoolState::Closed,
            }
        }

        info!("worker pool stopping");
        let _ = self.shutdown_tx.send(true);

        // Workers finish the attempt they are on, then exit.
        let workers: Vec<JoinHandle<()>> = self.worker_handles.lock().drain(..).collect();
        for handle in workers {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked");
            }
        }

        // With the workers gone no new timers can appear; cancel the rest.
        let armed: Vec<JobId> = self.retry_timers.iter().map(|entry| *entry.key()).collect();
        for job_id in armed {
            if let Some((_, handle)) = self.retry_timers.remove(&job_id) {
                if let Err(err) = handle.await {
                    error!(error = %err, "retry timer task panicked");
                }
            }
        }

        // Dropping the last sender lets the drain task finish the buffered
        // results and exit.
        self.result_tx.lock().take();
        let drain = self.drain_handle.lock().take();
        if let Some(handle) = drain {
            if let Err(err) = handle.await {
                error!(error = %err, "result drain task panicked");
            }
        }

        let queued = self.job_tx.max_capacity() - self.job_tx.capacity();
        if queued > 0 {
            warn!(queued, "discarding queued jobs at shutdown");
        }
        info!("worker pool stopped");
        Ok(())
    }

    /// Snapshot the pool's state and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        let pending_results = self
            .result_tx
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);

        PoolStats {
            name: self.config.name.clone(),
            worker_count: self.config.workers,
            queue_capacity: self.config.queue_capacity,
            queued_jobs: self.job_tx.max_capacity() - self.job_tx.capacity(),
            pending_results,
            pending_retries: self.retry_timers.len(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped_jobs: self.counters.dropped_jobs.load(Ordering::Relaxed),
            dropped_results: self.counters.dropped_results.load(Ordering::Relaxed),
        }
    }

    async fn worker_loop(mut ctx: WorkerContext) {
        debug!(pool = %ctx.pool, worker = ctx.worker_id, "worker started");
        loop {
            // Hold the receiver lock only while waiting for one job.
            let job = {
                let mut job_rx = ctx.job_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = ctx.shutdown_rx.changed() => None,
                    job = job_rx.recv() => job,
                }
            };

            match job {
                Some(job) => Self::process_job(&ctx, job).await,
                // Shutdown signalled, or the queue closed behind us.
                None => break,
            }
        }
        debug!(pool = %ctx.pool, worker = ctx.worker_id, "worker stopped");
    }

    #[instrument(
        skip(ctx, job),
        fields(
            pool = %ctx.pool,
            worker = ctx.worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts(),
        )
    )]
    async fn process_job(ctx: &WorkerContext, mut job: Job) {
        let Some(handler) = ctx.registry.get(&job.job_type) else {
            warn!("no handler registered for job type");
            counter!("taskmill_jobs_total", "status" => "unhandled").increment(1);
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            // The handler was never invoked, so the result reports zero attempts.
            Self::deliver(
                ctx,
                JobResult::failure(
                    job.id,
                    format!("no handler registered for job type '{}'", job.job_type),
                    Duration::ZERO,
                    0,
                ),
            );
            return;
        };

        let started = Instant::now();
        // catch_unwind keeps a panicking handler from taking the worker task
        // down with it; the panic becomes a fatal error on this job alone.
        let attempt = AssertUnwindSafe(handler.handle(&job)).catch_unwind();
        let outcome = match tokio::time::timeout(ctx.config.job_timeout, attempt).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                error!("handler panicked, failing job");
                Err(JobError::fatal(panic_message(panic)))
            }
            Err(_) => Err(JobError::timeout(ctx.config.job_timeout)),
        };
        let duration = started.elapsed();
        histogram!("taskmill_job_duration_seconds", "job_type" => job.job_type.clone())
            .record(duration.as_secs_f64());

        match outcome {
            Ok(()) => {
                debug!(duration_ms = duration.as_millis() as u64, "job succeeded");
                counter!("taskmill_jobs_total", "status" => "succeeded").increment(1);
                ctx.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                Self::deliver(ctx, JobResult::success(job.id, duration, job.attempts()));
            }
            Err(err) if err.is_retryable() && !job.retries_exhausted() => {
                job.retries += 1;
                let delay = ctx.config.backoff.delay_for(job.retries);
                warn!(
                    error = %err,
                    retry = job.retries,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, scheduling retry"
                );
                counter!("taskmill_jobs_total", "status" => "retried").increment(1);
                ctx.counters.retried.fetch_add(1, Ordering::Relaxed);
                Self::schedule_retry(ctx, job, delay);
            }
            Err(err) => {
                warn!(error = %err, attempts = job.attempts(), "job failed terminally");
                counter!("taskmill_jobs_total", "status" => "failed").increment(1);
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                Self::deliver(
                    ctx,
                    JobResult::failure(job.id, err.to_string(), duration, job.attempts()),
                );
            }
        }
    }

    /// Hand a terminal result to the drain task. Delivery is at most once:
    /// a full results channel drops the result rather than stalling the
    /// worker.
    fn deliver(ctx: &WorkerContext, result: JobResult) {
        match ctx.result_tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => {
                warn!(
                    pool = %ctx.pool,
                    job_id = %result.job_id,
                    "results channel full, dropping result"
                );
                counter!("taskmill_results_dropped_total").increment(1);
                ctx.counters.dropped_results.fetch_add(1, Ordering::Relaxed);
            }
            // The pool is tearing down; the drain already finished.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Arm a timer that re-submits `job` after `delay`, unless shutdown wins
    /// the race. Timers track themselves in the pool's map so `stop` can
    /// cancel them deterministically.
    fn schedule_retry(ctx: &WorkerContext, job: Job, delay: Duration) {
        let job_id = job.id;
        let job_tx = ctx.job_tx.clone();
        let timers = Arc::clone(&ctx.retry_timers);
        let counters = ctx.counters.clone();
        let mut shutdown_rx = ctx.shutdown_rx.clone();
        let pool = ctx.pool.clone();
        // The timer removes itself from the map when it finishes. With a
        // zero delay it could finish before the insert below ever ran,
        // stranding a finished handle in the map, so the body waits for
        // the registration signal first.
        let registered = Arc::new(Notify::new());
        let registration = Arc::clone(&registered);

        gauge!("taskmill_retry_timers").increment(1.0);
        let handle = tokio::spawn(async move {
            registration.notified().await;
            // A stop that already happened cancels without sleeping.
            if !*shutdown_rx.borrow() {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(pool = %pool, %job_id, "retry timer cancelled");
                    }
                    _ = tokio::time::sleep(delay) => {
                        match job_tx.try_send(job) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(pool = %pool, %job_id, "job queue full on retry, dropping job");
                                counter!("taskmill_retries_dropped_total").increment(1);
                                counters.dropped_jobs.fetch_add(1, Ordering::Relaxed);
                            }
                            // Teardown already won; nothing is listening.
                            Err(TrySendError::Closed(_)) => {
                                debug!(pool = %pool, %job_id, "pool closed before retry, dropping job");
                            }
                        }
                    }
                }
            }
            timers.remove(&job_id);
            gauge!("taskmill_retry_timers").decrement(1.0);
        });
        ctx.retry_timers.insert(job_id, handle);
        // Stored permit: the wakeup holds even if the task has not reached
        // `notified()` yet.
        registered.notify_one();
    }
}

/// Renders a caught panic payload into a job error message. Panics raised
/// with `panic!("...")` carry a `&str` or `String`; anything else is opaque.
fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {detail}")
}
