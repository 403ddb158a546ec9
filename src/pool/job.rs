//! Job descriptions, handler errors, and terminal result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique job identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work queued on a pool.
///
/// The payload is an opaque JSON document; the handler registered for
/// `job_type` decides how to decode it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Retries consumed so far.
    #[serde(default)]
    pub retries: u32,
    /// Retry budget beyond the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Job {
    /// Create a job with a fresh id and the default retry budget.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }

    /// Override the retry budget. Zero disables retries entirely.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Attempts made so far, counting the initial one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Error returned by a job handler.
///
/// The retryable flag decides whether the pool re-queues the job (budget
/// permitting) or fails it terminally on the spot.
#[derive(Debug, Clone)]
pub struct JobError {
    message: String,
    retryable: bool,
}

impl JobError {
    /// A transient failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; the job fails without touching its retry budget.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// An attempt that outran the pool's job timeout. Retryable.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            message: format!("job timed out after {timeout:?}"),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

/// Terminal outcome of a job. Emitted at most once per job, after the final
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub success: bool,
    /// Present exactly when the job failed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Execution time of the final attempt.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
    /// Handler invocations made in total, counting the first. Zero when the
    /// job failed before dispatch because no handler was registered.
    pub attempts: u32,
}

impl JobResult {
    pub fn success(job_id: JobId, duration: Duration, attempts: u32) -> Self {
        Self {
            job_id,
            success: true,
            error: None,
            duration,
            completed_at: Utc::now(),
            attempts,
        }
    }

    pub fn failure(
        job_id: JobId,
        error: impl Into<String>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            job_id,
            success: false,
            error: Some(error.into()),
            duration,
            completed_at: Utc::now(),
            attempts,
        }
    }
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// The same delay before every retry.
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Delay grows linearly with the retry number.
    Linear {
        #[serde(with = "humantime_serde")]
        step: Duration,
    },
    /// Delay grows with the square of the retry number.
    Quadratic {
        #[serde(with = "humantime_serde")]
        unit: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Quadratic {
            unit: Duration::from_secs(1),
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { step } => step.saturating_mul(attempt),
            Self::Quadratic { unit } => unit.saturating_mul(attempt.saturating_mul(attempt)),
        }
    }
}
