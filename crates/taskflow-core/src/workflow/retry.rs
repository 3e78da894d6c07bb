//! `_retry` policy evaluation.
//!
//! Stateless apart from the task's own state params: the retry counter is
//! stored under `retry_count` and incremented on every retry.

use serde_json::Value;
use taskflow_types::document::Document;
use taskflow_types::error::ConfigError;

const RETRY_KEY: &str = "_retry";
const RETRY_COUNT: &str = "retry_count";

// ---------------------------------------------------------------------------
// RetryIntervalType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryIntervalType {
    Constant,
    Exponential,
}

impl RetryIntervalType {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "constant" => Ok(RetryIntervalType::Constant),
            "exponential" => Ok(RetryIntervalType::Exponential),
            _ => Err(ConfigError::invalid_value(
                "interval_type",
                format!("expected 'constant' or 'exponential' but got '{value}'"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryControl
// ---------------------------------------------------------------------------

/// Retry decision for one task, built from its config and state params.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryControl {
    state_params: Document,
    limit: u32,
    count: u32,
    interval: u32,
    max_interval: Option<u32>,
    interval_type: RetryIntervalType,
}

impl RetryControl {
    /// Parse `_retry` from `config`.
    ///
    /// Without `_retry`, the limit is 3 when `enable_by_default` is set and 0
    /// otherwise. `_retry` may be an integer (limit only) or
    /// `{limit, interval, max_interval, interval_type}`.
    pub fn prepare(
        config: &Document,
        state_params: &Document,
        enable_by_default: bool,
    ) -> Result<Self, ConfigError> {
        let count = non_negative(state_params.get_optional_i64(RETRY_COUNT)?.unwrap_or(0), RETRY_COUNT)?;
        let base = Self {
            state_params: state_params.clone(),
            limit: if enable_by_default { 3 } else { 0 },
            count,
            interval: 0,
            max_interval: None,
            interval_type: RetryIntervalType::Constant,
        };

        match config.get(RETRY_KEY) {
            None => Ok(base),
            Some(Value::Number(_) | Value::String(_)) => Ok(Self {
                limit: non_negative(config.get_i64(RETRY_KEY)?, RETRY_KEY)?,
                ..base
            }),
            Some(Value::Object(_)) => {
                let retry = config.get_nested(RETRY_KEY)?;
                let interval_type = match retry.get_optional_str("interval_type")? {
                    Some(s) => RetryIntervalType::parse(s)?,
                    None => RetryIntervalType::Constant,
                };
                Ok(Self {
                    limit: non_negative(retry.get_i64("limit")?, "limit")?,
                    interval: non_negative(retry.get_optional_i64("interval")?.unwrap_or(0), "interval")?,
                    max_interval: retry
                        .get_optional_i64("max_interval")?
                        .map(|v| non_negative(v, "max_interval"))
                        .transpose()?,
                    interval_type,
                    ..base
                })
            }
            Some(other) => Err(ConfigError::invalid(format!("Invalid _retry format: {other}"))),
        }
    }

    /// Whether another attempt is allowed.
    pub fn evaluate(&self) -> bool {
        self.limit > self.count
    }

    /// Seconds to wait before the next attempt.
    pub fn next_retry_interval(&self) -> u32 {
        match self.interval_type {
            RetryIntervalType::Constant => self.interval,
            RetryIntervalType::Exponential => {
                let factor = 2u32.checked_pow(self.count).unwrap_or(u32::MAX);
                let interval = self.interval.saturating_mul(factor);
                match self.max_interval {
                    Some(max) => interval.min(max),
                    None => interval,
                }
            }
        }
    }

    /// State params for the next attempt (`retry_count + 1`).
    pub fn next_retry_state_params(&self) -> Document {
        let mut next = self.state_params.clone();
        next.set(RETRY_COUNT, self.count + 1);
        next
    }

    pub fn retry_count(&self) -> u32 {
        self.count
    }
}

fn non_negative(value: i64, key: &str) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::invalid_value(key, "must be a non-negative integer"))
}
