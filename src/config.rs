//! Configuration management.

use serde::Deserialize;

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::pool::PoolConfig;
use crate::telemetry::LoggingConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment ("development", "staging", "production")
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Batch executor configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// TTL cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            logging: LoggingConfig::default(),
            pool: PoolConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

// Default value functions
fn default_environment() -> String {
    "development".to_string()
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Variables use the `TASKMILL` prefix with `__` as the nesting
    /// separator, e.g. `TASKMILL__POOL__WORKERS=8`.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TASKMILL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TASKMILL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Whether this is a development environment.
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}
