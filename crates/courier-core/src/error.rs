//! Process-level error type shared by the Courier crates.

use std::fmt::Debug;
use thiserror::Error;

/// Error raised while bootstrapping or driving the worker queue from a binary.
///
/// Scheduling and delivery code has its own narrower error types; they convert
/// into this one at the process boundary.
#[derive(Error, Debug)]
pub enum CourierError {
    // ============ Infrastructure Errors ============
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Lock or cache backend error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem or process I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ============ Runtime Errors ============
    /// Another instance already owns a singleton resource (pidfile, lock)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CourierError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Process exit code used by the CLI for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 78,
            Self::Conflict(_) => 75,
            Self::Database(_) | Self::Cache(_) | Self::Timeout(_) => 69,
            Self::Io(_) => 74,
            Self::Internal(_) | Self::Other(_) => 70,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Cache(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for CourierError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Configuration(_) => Self::Configuration(err.to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CourierError::Database("down".to_string()).error_code(), "DATABASE_ERROR");
        assert_eq!(CourierError::configuration("bad").error_code(), "CONFIGURATION_ERROR");
        assert_eq!(CourierError::Conflict("pidfile".to_string()).error_code(), "CONFLICT");
        assert_eq!(CourierError::internal("oops").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CourierError::configuration("bad").exit_code(), 78);
        assert_eq!(CourierError::Conflict("running".to_string()).exit_code(), 75);
        assert_eq!(CourierError::Database("down".to_string()).exit_code(), 69);
    }

    #[test]
    fn test_retriable_errors() {
        assert!(CourierError::Database("connection lost".to_string()).is_retriable());
        assert!(CourierError::Timeout("pool".to_string()).is_retriable());
        assert!(!CourierError::configuration("missing url").is_retriable());
        assert!(!CourierError::Conflict("running".to_string()).is_retriable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "pidfile");
        let err = CourierError::from(io);
        assert_eq!(err.error_code(), "IO_ERROR");
        assert!(err.to_string().contains("pidfile"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<Vec<String>>("not json").unwrap_err();
        let err = CourierError::from(json_err);
        assert!(err.to_string().contains("JSON serialization error"));
    }
}
