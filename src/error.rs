//! Error types for the task-execution toolkit.
//!
//! A single crate-level [`Error`] covers every synchronous failure surface:
//! submission rejections from the worker pool, lifecycle misuse, batch and
//! pipeline propagation, and configuration loading. Handler-side failures are
//! a separate concern and travel as [`crate::pool::JobError`] inside the
//! retry machinery instead of bubbling through this enum.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously by the toolkit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The job queue is at capacity; the submission was rejected without
    /// blocking. The producer decides whether to retry, shed, or back off.
    #[error("job queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity of the input queue.
        capacity: usize,
    },

    /// Shutdown has begun; no further submissions are accepted.
    #[error("worker pool is closed")]
    PoolClosed,

    /// Registration or start was attempted while workers are already running.
    #[error("worker pool is already running")]
    PoolRunning,

    /// A batch did not finish within the configured per-batch timeout.
    #[error("batch {index} timed out after {timeout:?}")]
    BatchTimeout {
        /// Index of the batch in input order.
        index: usize,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A spawned task could not be joined (it panicked or was aborted).
    #[error("task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Configuration could not be loaded or deserialized.
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// A payload or record failed to (de)serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation or adapter-supplied failure.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Build an [`Error::Internal`] from any message.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Submission pressure and timeouts are transient; lifecycle and
    /// configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. } | Error::BatchTimeout { .. }
        )
    }

    /// Coarse classification used as a metrics label and in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Error::QueueFull { .. } | Error::PoolClosed => "submission",
            Error::PoolRunning => "lifecycle",
            Error::BatchTimeout { .. } => "timeout",
            Error::Join(_) => "join",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::QueueFull { capacity: 64 };
        assert_eq!(err.to_string(), "job queue is full (capacity 64)");

        assert_eq!(Error::PoolClosed.to_string(), "worker pool is closed");
        assert_eq!(
            Error::PoolRunning.to_string(),
            "worker pool is already running"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::QueueFull { capacity: 1 }.is_retryable());
        assert!(Error::BatchTimeout {
            index: 0,
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!Error::PoolClosed.is_retryable());
        assert!(!Error::PoolRunning.is_retryable());
        assert!(!Error::internal("boom").is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(Error::QueueFull { capacity: 1 }.category(), "submission");
        assert_eq!(Error::PoolClosed.category(), "submission");
        assert_eq!(Error::PoolRunning.category(), "lifecycle");
        assert_eq!(Error::internal("x").category(), "internal");
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json")
            .expect_err("must fail");
        let err: Error = parse_err.into();
        assert_eq!(err.category(), "serialization");
    }
}
