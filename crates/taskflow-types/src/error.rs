use thiserror::Error;

/// Errors raised while reading or validating configuration documents.
///
/// Covers workflow definitions, `_retry` / `_parallel` options and schedule
/// configs. These are never retried: they surface at compile or
/// schedule-resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("parameter '{0}' is required but not set")]
    MissingKey(String),

    #[error("parameter '{key}' must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }

    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors from repository operations (used by trait definitions in taskflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingKey("limit".to_string());
        assert_eq!(err.to_string(), "parameter 'limit' is required but not set");

        let err = ConfigError::WrongType {
            key: "_parallel".to_string(),
            expected: "a boolean",
        };
        assert_eq!(err.to_string(), "parameter '_parallel' must be a boolean");
    }

    #[test]
    fn test_config_error_invalid_value() {
        let err = ConfigError::invalid_value("interval_type", "expected constant or exponential");
        assert!(err.to_string().contains("interval_type"));
        assert!(err.to_string().contains("exponential"));
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
