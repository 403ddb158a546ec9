//! # Taskmill
//!
//! Concurrent task execution building blocks for async services.
//!
//! ## Architecture
//!
//! - **Worker Pool**: Bounded job queue, typed handlers, retries with backoff, graceful shutdown
//! - **Batch Executor**: Fixed-size batches with a concurrency cap and per-batch timeouts
//! - **Pipeline**: Ordered stages connected by bounded channels, first-error reporting
//! - **Cache**: TTL map with lazy expiry and a background sweeper
//! - **Telemetry**: Structured logging and metrics wired through every component
//! - **Config**: Environment and file based configuration with sane defaults

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod telemetry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batch::{BatchConfig, BatchExecutor};
    pub use crate::cache::{CacheConfig, CacheStats, TtlCache};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{FnStage, MapStage, Pipeline, Stage};
    pub use crate::pool::{
        BackoffStrategy, HandlerRegistry, Job, JobError, JobHandler, JobId, JobResult,
        NoOpHandler, PoolConfig, PoolStats, SleepHandler, WorkerPool,
    };
    pub use crate::telemetry::{init_logging, LogFormat, LoggingConfig};
}
