//! Error types for Hopper

use thiserror::Error;

/// Result type alias using Hopper's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Hopper operations
#[derive(Error, Debug)]
pub enum Error {
    /// Publish called with a job that has no payload
    #[error("invalid job: the job is empty")]
    EmptyJob,

    /// Operation attempted on a closed iterator
    #[error("iterator already closed")]
    AlreadyClosed,

    /// Ack/Reject without a bound acknowledger, or a second disposition
    #[error("can't acknowledge this job, it does not come from a queue or was already acknowledged")]
    CannotAcknowledge,

    /// The backend cannot stage and commit publishes atomically
    #[error("transactions not supported")]
    TransactionsNotSupported,

    /// No constructor registered for a broker URI scheme
    #[error("unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    /// A finite iterator ran out of jobs
    #[error("end of stream")]
    EndOfStream,

    /// Initial connection to the backend failed
    #[error("broker connection error: {0}")]
    Connection(String),

    /// An established connection or channel went away
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// Reconnection gave up after exhausting the backoff policy
    #[error("reconnect failed after {attempts} attempts: {message}")]
    ReconnectFailed { attempts: u32, message: String },

    /// Backend operation failed
    #[error("broker error: {0}")]
    Broker(String),

    /// Content type with no registered codec
    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error comes from connectivity and may go away after
    /// reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::ConnectionLost(_))
    }

    /// Check if this is a caller-side validation error. These are never
    /// retried internally.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyJob
                | Error::AlreadyClosed
                | Error::CannotAcknowledge
                | Error::TransactionsNotSupported
                | Error::UnsupportedScheme(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_not_retryable() {
        for err in [
            Error::EmptyJob,
            Error::AlreadyClosed,
            Error::CannotAcknowledge,
            Error::TransactionsNotSupported,
        ] {
            assert!(err.is_validation());
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        assert!(Error::ConnectionLost("reset".into()).is_retryable());
        assert!(!Error::Broker("PRECONDITION_FAILED".into()).is_retryable());
        assert!(!Error::ReconnectFailed {
            attempts: 3,
            message: "refused".into()
        }
        .is_retryable());
    }
}
