//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::telemetry::LoggingConfig;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Dedicated transaction connections kept open for reuse
    #[serde(default = "default_max_idle_transactions")]
    pub max_idle_transactions: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_idle_transactions: default_max_idle_transactions(),
        }
    }
}

/// Behaviour of a single [`crate::queue::ScheduledQueue`].
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Prefix for every key the queue owns
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Whether `each` keeps polling when nothing is due
    #[serde(default)]
    pub blocking: bool,

    /// Sleep between due-queries while nothing is due (blocking mode)
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Sleep after a rejected optimistic commit
    #[serde(default = "default_conflict_backoff", with = "humantime_serde")]
    pub conflict_backoff: Duration,

    /// Entries fetched per page by the debug view
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            blocking: false,
            poll_interval: default_poll_interval(),
            conflict_backoff: default_conflict_backoff(),
            page_size: default_page_size(),
        }
    }
}

impl QueueConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(QueueError::new(
                crate::error::ErrorCode::InvalidConfiguration,
                "queue namespace must not be empty",
            ));
        }
        if self.page_size == 0 {
            return Err(QueueError::new(
                crate::error::ErrorCode::InvalidConfiguration,
                "queue page_size must be at least 1",
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_max_idle_transactions() -> usize { 8 }
fn default_namespace() -> String { "tickq".to_string() }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_conflict_backoff() -> Duration { Duration::from_millis(10) }
fn default_page_size() -> usize { 100 }

impl Config {
    /// Load configuration from the environment (`TICKQ__QUEUE__NAMESPACE=...`).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TICKQ").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.queue.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TICKQ").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.queue.validate()?;
        Ok(cfg)
    }
}
