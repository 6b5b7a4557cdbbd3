//! Queue error types.

use crate::job::JobId;
use thiserror::Error;

/// Result type for queue operations.
pub type JobResult<T> = Result<T, JobError>;

/// The job or delivery store could not be reached or rejected a statement.
///
/// Always treated as transient: the tick or sweep that hit it is retried on
/// its next run.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back to a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// The operating system refused to spawn or signal a worker.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Process creation or signalling failed.
    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The child exited before its pid could be read.
    #[error("Spawned process has no pid")]
    MissingPid,

    /// Process control is not available on this platform.
    #[error("Process control unsupported: {0}")]
    Unsupported(String),
}

/// A claimed job whose worker is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stale claim on job {job_id}: worker pid {pid} is not running")]
pub struct StaleProcessError {
    pub job_id: JobId,
    pub pid: u32,
}

/// Outcome of a failed delivery attempt to a remote inbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The remote did not answer in time.
    #[error("Delivery timed out")]
    Timeout,

    /// The remote answered with a 5xx status.
    #[error("Remote server error: HTTP {0}")]
    ServerError(u16),

    /// The remote asked to retry later (408 or 429).
    #[error("Remote throttled delivery: HTTP {0}")]
    Throttled(u16),

    /// The remote permanently rejected the activity (any other 4xx but 410).
    #[error("Remote rejected activity: HTTP {0}")]
    ClientError(u16),

    /// Connection or protocol error.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl DeliveryFailure {
    /// Returns true if the failure says the whole remote server is unhealthy,
    /// as opposed to one activity being rejected.
    pub fn is_server_failure(&self) -> bool {
        !matches!(self, DeliveryFailure::ClientError(_))
    }

    /// HTTP status code, if the remote answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryFailure::ServerError(code)
            | DeliveryFailure::Throttled(code)
            | DeliveryFailure::ClientError(code) => Some(*code),
            DeliveryFailure::Timeout | DeliveryFailure::Transport(_) => None,
        }
    }
}

/// Queue-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Store error.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Spawn error.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Delivery error.
    #[error(transparent)]
    Delivery(#[from] DeliveryFailure),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// No executor is registered for the command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Job parameters do not match what the command expects.
    #[error("Invalid parameters for {command}: {message}")]
    InvalidParameters { command: String, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A named lock could not be acquired in time.
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),

    /// Another instance already owns a singleton resource.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Persistence(_) | JobError::LockTimeout(_) | JobError::Io(_) => true,
            JobError::Delivery(failure) => failure.is_server_failure(),
            _ => false,
        }
    }

    /// Shorthand for a parameter error.
    pub fn invalid_parameters(command: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::InvalidParameters {
            command: command.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::Persistence(err.into())
    }
}

impl From<redis::RedisError> for JobError {
    fn from(err: redis::RedisError) -> Self {
        JobError::Persistence(err.into())
    }
}

impl From<deadpool_redis::PoolError> for JobError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        JobError::Persistence(err.into())
    }
}

impl From<JobError> for courier_core::CourierError {
    fn from(err: JobError) -> Self {
        use courier_core::CourierError;

        match err {
            JobError::Persistence(PersistenceError::Redis(e)) => CourierError::Cache(e.to_string()),
            JobError::Persistence(PersistenceError::Pool(e)) => CourierError::Cache(e.to_string()),
            JobError::Persistence(e) => CourierError::Database(e.to_string()),
            JobError::Configuration(msg) => CourierError::Configuration(msg),
            JobError::Conflict(msg) => CourierError::Conflict(msg),
            JobError::LockTimeout(name) => CourierError::Timeout(format!("lock {}", name)),
            JobError::Io(e) => CourierError::Io(e),
            other => CourierError::Internal(other.to_string()),
        }
    }
}
