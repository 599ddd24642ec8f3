//! Configuration structures for Hopper

use crate::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for Hopper
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HopperConfig {
    /// Broker selection
    #[serde(default)]
    pub broker: BrokerConfig,

    /// In-memory backend settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// AMQP backend settings
    #[serde(default)]
    pub amqp: AmqpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HopperConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Configuration(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Merge configuration from file and environment. Environment variables
    /// take precedence.
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("HOPPER_BROKER_URL") {
            self.broker.url = url;
        }

        if let Some(ms) = env_parse::<u64>("HOPPER_MEMORY_POLL_INTERVAL_MS")? {
            self.memory.poll_interval_ms = ms;
        }

        let amqp = &mut self.amqp;
        if let Some(ms) = env_parse::<u64>("HOPPER_AMQP_BACKOFF_MIN_MS")? {
            amqp.backoff_min_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("HOPPER_AMQP_BACKOFF_MAX_MS")? {
            amqp.backoff_max_ms = ms;
        }
        if let Some(factor) = env_parse::<f64>("HOPPER_AMQP_BACKOFF_FACTOR")? {
            amqp.backoff_factor = factor;
        }
        if let Some(attempts) = env_parse::<u32>("HOPPER_AMQP_MAX_RECONNECT_ATTEMPTS")? {
            amqp.max_reconnect_attempts = Some(attempts);
        }
        if let Ok(suffix) = std::env::var("HOPPER_AMQP_BURIED_QUEUE_SUFFIX") {
            amqp.buried_queue_suffix = suffix;
        }
        if let Ok(suffix) = std::env::var("HOPPER_AMQP_BURIED_EXCHANGE_SUFFIX") {
            amqp.buried_exchange_suffix = suffix;
        }
        if let Some(ms) = env_parse::<u64>("HOPPER_AMQP_BURIED_TIMEOUT_MS")? {
            amqp.buried_timeout_ms = ms;
        }
        if let Ok(header) = std::env::var("HOPPER_AMQP_RETRIES_HEADER") {
            amqp.retries_header = header;
        }
        if let Ok(header) = std::env::var("HOPPER_AMQP_ERROR_HEADER") {
            amqp.error_header = header;
        }

        if let Ok(level) = std::env::var("HOPPER_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| crate::Error::Configuration(format!("invalid {}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker URI, `scheme://...`
    #[serde(default = "default_broker_url")]
    pub url: String,
}

fn default_broker_url() -> String {
    "memory://".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

/// In-memory backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// How long an idle iterator sleeps before looking for jobs again
    #[serde(default = "default_memory_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_memory_poll_interval() -> u64 {
    100
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_memory_poll_interval(),
        }
    }
}

impl MemoryConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// AMQP backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    /// Minimum reconnect delay in milliseconds
    #[serde(default = "default_backoff_min")]
    pub backoff_min_ms: u64,

    /// Maximum reconnect delay in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Reconnect delay growth factor
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Give up reconnecting after this many attempts (unbounded if unset)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Suffix of the buried (dead-letter) queue name
    #[serde(default = "default_buried_queue_suffix")]
    pub buried_queue_suffix: String,

    /// Suffix of the buried (dead-letter) exchange name
    #[serde(default = "default_buried_exchange_suffix")]
    pub buried_exchange_suffix: String,

    /// How long republishing waits on an idle buried queue, in milliseconds
    #[serde(default = "default_buried_timeout")]
    pub buried_timeout_ms: u64,

    /// Header carrying the retry counter
    #[serde(default = "default_retries_header")]
    pub retries_header: String,

    /// Header carrying the error classification
    #[serde(default = "default_error_header")]
    pub error_header: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Wait for publisher confirms
    #[serde(default = "default_true")]
    pub publisher_confirms: bool,

    /// How often a waiting iterator checks whether it was closed, in
    /// milliseconds
    #[serde(default = "default_amqp_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_backoff_min() -> u64 {
    200
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_buried_queue_suffix() -> String {
    ".buriedQueue".to_string()
}

fn default_buried_exchange_suffix() -> String {
    ".buriedExchange".to_string()
}

fn default_buried_timeout() -> u64 {
    500
}

fn default_retries_header() -> String {
    "x-retries".to_string()
}

fn default_error_header() -> String {
    "x-error-type".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_amqp_poll_interval() -> u64 {
    1000
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: default_backoff_min(),
            backoff_max_ms: default_backoff_max(),
            backoff_factor: default_backoff_factor(),
            max_reconnect_attempts: None,
            buried_queue_suffix: default_buried_queue_suffix(),
            buried_exchange_suffix: default_buried_exchange_suffix(),
            buried_timeout_ms: default_buried_timeout(),
            retries_header: default_retries_header(),
            error_header: default_error_header(),
            pool_size: default_pool_size(),
            publisher_confirms: default_true(),
            poll_interval_ms: default_amqp_poll_interval(),
        }
    }
}

impl AmqpConfig {
    /// Backoff policy for reconnection
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_factor,
        )
        .with_max_attempts(self.max_reconnect_attempts)
    }

    /// Buried queue timeout as a duration
    pub fn buried_timeout(&self) -> Duration {
        Duration::from_millis(self.buried_timeout_ms)
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
