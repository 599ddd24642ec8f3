//! Hopper Telemetry - Logging setup
//!
//! Installs a `tracing` subscriber configured from
//! [`hopper_core::LoggingConfig`] and provides spans carrying queue and
//! job context.

pub mod logging;

pub use logging::{init_logging, JobLogContext, LogFormat, LoggingConfig};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
