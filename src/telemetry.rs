//! Structured logging setup and metric registration.
//!
//! Logging rides on `tracing`: JSON output for production, pretty output for
//! development, per-module level overrides on top of a base `EnvFilter`.
//! Metrics go through the `metrics` facade; this crate records counters,
//! histograms, and gauges at its instrumentation points and leaves recorder
//! installation (Prometheus, statsd, ...) to the embedding application.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level, or any `EnvFilter` directive string.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module overrides layered on the base level,
    /// e.g. `{"taskmill::pool": "debug"}`.
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Span lifecycle points logged as events, e.g. `["new", "close"]`.
    #[serde(default = "default_span_events")]
    pub span_events: Vec<SpanEvent>,

    /// Emit the callsite file and line.
    #[serde(default = "default_include_location")]
    pub include_location: bool,

    /// Emit thread ids and names.
    #[serde(default)]
    pub include_thread: bool,

    /// Emit the module path of the event.
    #[serde(default = "default_include_target")]
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            span_events: default_span_events(),
            include_location: default_include_location(),
            include_thread: false,
            include_target: default_include_target(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON lines.
    #[default]
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

/// A point in the span lifecycle worth a log event of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanEvent {
    New,
    Enter,
    Exit,
    Close,
}

impl SpanEvent {
    fn as_fmt_span(self) -> FmtSpan {
        match self {
            SpanEvent::New => FmtSpan::NEW,
            SpanEvent::Enter => FmtSpan::ENTER,
            SpanEvent::Exit => FmtSpan::EXIT,
            SpanEvent::Close => FmtSpan::CLOSE,
        }
    }
}

fn fmt_span_for(events: &[SpanEvent]) -> FmtSpan {
    events
        .iter()
        .fold(FmtSpan::NONE, |acc, event| acc | event.as_fmt_span())
}

// Default value functions
fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_span_events() -> Vec<SpanEvent> {
    vec![SpanEvent::Close]
}

fn default_include_location() -> bool {
    true
}

fn default_include_target() -> bool {
    true
}

/// Install the global tracing subscriber.
///
/// Call once at process startup. The `development` environment prefers pretty
/// output when no format was chosen explicitly.
///
/// # Errors
///
/// Returns an error if a filter directive does not parse or a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let mut filter = EnvFilter::try_new(&config.level)?;
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(format!("{module}={level}").parse()?);
    }

    let format = if environment == "development" && config.format == LogFormat::Json {
        LogFormat::Pretty
    } else {
        config.format
    };

    let base = fmt::layer()
        .with_span_events(fmt_span_for(&config.span_events))
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread)
        .with_thread_names(config.include_thread)
        .with_target(config.include_target);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(base.json()).try_init()?,
        LogFormat::Pretty => registry.with(base.pretty()).try_init()?,
        LogFormat::Compact => registry.with(base.compact()).try_init()?,
    }
    Ok(())
}

/// Register descriptions for every metric this crate emits.
///
/// Optional; call after installing a recorder so exported metadata carries
/// help text.
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        "taskmill_jobs_submitted_total",
        "Jobs accepted into the worker pool queue"
    );
    describe_counter!(
        "taskmill_jobs_total",
        "Terminal job results by status label"
    );
    describe_counter!(
        "taskmill_results_dropped_total",
        "Terminal results dropped because the result queue was full"
    );
    describe_counter!(
        "taskmill_retries_dropped_total",
        "Retry re-submissions dropped because the job queue was full"
    );
    describe_histogram!(
        "taskmill_job_duration_seconds",
        "Wall-clock duration of job attempts"
    );
    describe_gauge!(
        "taskmill_retry_timers",
        "Retry timers currently armed and waiting to re-enqueue"
    );
    describe_counter!(
        "taskmill_batches_total",
        "Batch invocations by status label"
    );
    describe_counter!(
        "taskmill_cache_hits_total",
        "Cache reads that found a live entry"
    );
    describe_counter!(
        "taskmill_cache_misses_total",
        "Cache reads that found nothing or an expired entry"
    );
    describe_counter!(
        "taskmill_cache_swept_total",
        "Expired cache entries removed by the background sweep"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.span_events, vec![SpanEvent::Close]);
        assert!(config.include_location);
        assert!(config.include_target);
        assert!(!config.include_thread);
        assert!(config.module_levels.is_empty());
    }

    #[test]
    fn test_span_events_fold_into_fmt_span() {
        assert_eq!(fmt_span_for(&[]), FmtSpan::NONE);
        assert_eq!(fmt_span_for(&[SpanEvent::Close]), FmtSpan::CLOSE);
        assert_eq!(
            fmt_span_for(&[SpanEvent::New, SpanEvent::Close]),
            FmtSpan::NEW | FmtSpan::CLOSE
        );
    }

    #[test]
    fn test_span_event_deserialize() {
        let events: Vec<SpanEvent> = serde_json::from_str(r#"["new", "exit"]"#).unwrap();
        assert_eq!(events, vec![SpanEvent::New, SpanEvent::Exit]);
    }

    #[test]
    fn test_log_format_deserialize() {
        let format: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(format, LogFormat::Pretty);

        let format: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(format, LogFormat::Compact);
    }

    #[test]
    fn test_describe_metrics_is_safe_without_recorder() {
        // Describe macros are no-ops when no recorder is installed.
        describe_metrics();
    }
}
