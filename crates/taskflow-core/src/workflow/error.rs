//! Error types of the session executor and the dispatch boundary.

use taskflow_types::error::{ConfigError, RepositoryError};
use taskflow_types::task::{SessionId, TaskId};

/// Errors from the task dispatch boundary.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No operator is registered for the task's `x>` key or `_type`.
    #[error("unknown operator type: {0}")]
    UnknownOperator(String),

    /// The task config names no operator at all.
    #[error("task '{0}' has no operator")]
    NoOperator(String),

    /// The queue refused the task.
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by [`SessionExecutor`](super::executor::SessionExecutor).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ExecutorError::TaskNotFound(7).to_string(), "task 7 not found");
        let err: ExecutorError = DispatchError::UnknownOperator("py".to_string()).into();
        assert_eq!(err.to_string(), "unknown operator type: py");
        let err: ExecutorError = ConfigError::MissingKey("limit".to_string()).into();
        assert!(err.to_string().starts_with("configuration error"));
    }
}
