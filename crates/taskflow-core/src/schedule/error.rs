//! Error type of the schedule drivers.

use taskflow_types::error::{ConfigError, RepositoryError};

use crate::workflow::error::ExecutorError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// No registered factory matches the schedule config.
    #[error("unknown scheduler type: {0}")]
    UnknownType(String),

    #[error("invalid cron pattern '{pattern}': {message}")]
    InvalidCron { pattern: String, message: String },

    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
}
