//! Structured logging for Hopper
//!
//! Provides:
//! - Configurable log levels with environment-based filtering
//! - Pretty, compact or JSON output
//! - Job context spans

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include file/line information
    pub include_location: bool,

    /// Include target (module path)
    pub include_target: bool,

    /// Environment filter string (e.g., "hopper_broker=debug,lapin=warn").
    /// Overrides `level` when set.
    pub env_filter: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, colored)
    #[default]
    Pretty,
    /// Compact format (single line)
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(TelemetryError::Config(format!(
                "unknown log format: {}",
                other
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: false,
            include_target: true,
            env_filter: None,
        }
    }
}

impl TryFrom<&hopper_core::LoggingConfig> for LoggingConfig {
    type Error = TelemetryError;

    fn try_from(config: &hopper_core::LoggingConfig) -> TelemetryResult<Self> {
        Ok(Self {
            level: config.level.clone(),
            format: config.format.parse()?,
            ..Default::default()
        })
    }
}

impl LoggingConfig {
    fn filter(&self) -> TelemetryResult<EnvFilter> {
        let directives = self.env_filter.as_deref().unwrap_or(&self.level);
        EnvFilter::try_new(directives).map_err(|e| TelemetryError::Logging(e.to_string()))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
        }
    }
}

/// Initialize logging with configuration
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = config.filter()?;

    tracing_subscriber::registry()
        .with(config.layer())
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::info!(
        "Logging initialized with level: {}, format: {:?}",
        config.level,
        config.format
    );

    Ok(())
}

/// Log context for handling one job
#[derive(Debug, Clone)]
pub struct JobLogContext {
    pub job_id: String,
    pub queue: String,
    pub priority: u8,
    pub retries: i32,
}

impl JobLogContext {
    /// Create a new job log context
    pub fn new(job: &hopper_core::Job, queue: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: queue.to_string(),
            priority: job.priority.as_u8(),
            retries: job.retries,
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            queue = %self.queue,
            priority = self.priority,
            retries = self.retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_from_core_config() {
        let core = hopper_core::LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
        };
        let config = LoggingConfig::try_from(&core).unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.enabled);
    }

    #[test]
    fn test_env_filter_overrides_level() {
        let config = LoggingConfig {
            env_filter: Some("hopper_broker=debug".to_string()),
            ..Default::default()
        };
        assert!(config.filter().is_ok());

        let bad = LoggingConfig {
            level: "hopper=notalevel".to_string(),
            ..Default::default()
        };
        assert!(bad.filter().is_err());
    }

    #[test]
    fn test_disabled_logging_is_a_noop() {
        let config = LoggingConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(init_logging(config).is_ok());
    }

    #[test]
    fn test_job_span() {
        let job = hopper_core::Job::new();
        let context = JobLogContext::new(&job, "emails");
        assert_eq!(context.job_id, job.id);
        assert_eq!(context.priority, 4);
        let _span = context.span();
    }
}
