//! Typed background job execution.
//!
//! This module provides a bounded worker pool with:
//!
//! - **Jobs**: JSON payloads dispatched by job type with per-job retry budgets
//! - **Handlers**: Trait-based handlers registered per job type, frozen at start
//! - **Retries**: Configurable backoff with cancellable timers
//! - **Results**: One terminal result per completed job, fanned out to subscribers
//! - **Shutdown**: Graceful stop that finishes in-flight work
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           Worker Pool                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  submit ──▶ ┌───────────┐     ┌───────────┐     ┌───────────────┐   │
//! │             │ Job Queue │────▶│  Workers  │────▶│ Results Drain │──▶ subscribers
//! │             │ (bounded) │     │ (N tasks) │     │  (broadcast)  │   │
//! │             └───────────┘     └───────────┘     └───────────────┘   │
//! │                   ▲                 │                               │
//! │                   │           ┌───────────┐                         │
//! │                   └───────────│   Retry   │                         │
//! │                    re-submit  │  Timers   │                         │
//! │                               └───────────┘                         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job lifecycle
//!
//! ```text
//!             ┌──────────────── backoff ────────────────┐
//!             ▼                                          │
//!  submit ─▶ queued ─▶ running ─┬─▶ succeeded ─▶ result  │
//!                               ├─▶ retrying ────────────┘
//!                               └─▶ failed    ─▶ result
//! ```
//!
//! A retryable failure with budget left re-queues the job after the backoff
//! delay; a fatal failure or an exhausted budget produces a terminal failure
//! result immediately. A panicking handler is caught and treated as a fatal
//! failure for that job only.
//!
//! # Usage
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use taskmill::pool::{Job, JobError, JobHandler, PoolConfig, WorkerPool};
//!
//! struct EmailHandler;
//!
//! #[async_trait]
//! impl JobHandler for EmailHandler {
//!     fn job_type(&self) -> &str { "email" }
//!
//!     async fn handle(&self, job: &Job) -> Result<(), JobError> {
//!         // Decode job.payload and do the work...
//!         Ok(())
//!     }
//! }
//!
//! let pool = WorkerPool::new(PoolConfig::default().with_workers(8));
//! pool.register_handler(EmailHandler)?;
//! pool.start()?;
//!
//! let mut results = pool.subscribe();
//! pool.submit(Job::new("email", serde_json::json!({"to": "ops@example.com"})))?;
//! let result = results.recv().await?;
//!
//! pool.stop().await?;
//! ```

pub mod handler;
pub mod job;
pub mod worker;

pub use handler::{HandlerRegistry, JobHandler, NoOpHandler, SleepHandler};
pub use job::{BackoffStrategy, Job, JobError, JobId, JobResult};
pub use worker::{PoolConfig, PoolStats, WorkerPool};
