//! Schedules: trigger time computation and the drivers that start sessions.
//!
//! - `cron` -- cron-backed schedulers (`cron>`, `daily>`, `hourly>`, `minutes_interval>`)
//! - `sla` -- SLA deadline parsing and computation
//! - `executor` -- polls due workflow schedules and submits sessions
//! - `sla_executor` -- polls due SLA rows and runs SLA tasks

pub mod cron;
pub mod error;
pub mod executor;
pub mod sla;
pub mod sla_executor;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use taskflow_types::document::Document;
use taskflow_types::schedule::ScheduleTime;

pub use error::SchedulerError;

use crate::workflow::operator::operator_type;

// ---------------------------------------------------------------------------
// Scheduler trait
// ---------------------------------------------------------------------------

/// Computes the trigger times of one schedule config.
pub trait Scheduler: Send + Sync {
    fn timezone(&self) -> Tz;

    /// First trigger at or after `reference`.
    fn first_schedule_time(&self, reference: DateTime<Utc>) -> Result<ScheduleTime, SchedulerError>;

    /// Trigger following the one with schedule time `last_schedule_time`.
    fn next_schedule_time(&self, last_schedule_time: DateTime<Utc>) -> Result<ScheduleTime, SchedulerError>;
}

/// Builds schedulers for the configs it matches.
pub trait SchedulerFactory: Send + Sync {
    /// Type name, e.g. `"cron"` for `cron>`.
    fn type_name(&self) -> &str;

    fn matches(&self, config: &Document) -> bool {
        schedule_type(config).as_deref() == Some(self.type_name())
    }

    fn new_scheduler(&self, config: &Document, timezone: Tz) -> Result<Box<dyn Scheduler>, SchedulerError>;
}

/// Scheduler type of a `schedule:` config: the `x>` key, else `_type`.
pub fn schedule_type(config: &Document) -> Option<String> {
    operator_type(config)
}

pub fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::UnknownTimeZone(name.to_string()))
}

// ---------------------------------------------------------------------------
// SchedulerManager
// ---------------------------------------------------------------------------

/// Registry of scheduler factories. The first matching factory wins.
pub struct SchedulerManager {
    factories: Vec<Box<dyn SchedulerFactory>>,
}

impl SchedulerManager {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Manager with the `cron`, `daily`, `hourly` and `minutes_interval` factories.
    pub fn with_builtins() -> Self {
        let mut manager = Self::new();
        for factory in cron::builtin_factories() {
            manager.factories.push(factory);
        }
        manager
    }

    pub fn register<F: SchedulerFactory + 'static>(&mut self, factory: F) {
        self.factories.push(Box::new(factory));
    }

    pub fn get_scheduler(&self, config: &Document, timezone: &str) -> Result<Box<dyn Scheduler>, SchedulerError> {
        let tz = parse_timezone(timezone)?;
        let factory = self
            .factories
            .iter()
            .find(|f| f.matches(config))
            .ok_or_else(|| SchedulerError::UnknownType(schedule_type(config).unwrap_or_else(|| "(none)".to_string())))?;
        factory.new_scheduler(config, tz)
    }
}

impl Default for SchedulerManager {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_schedule_type_from_key_or_type() {
        assert_eq!(schedule_type(&doc(json!({"cron>": "* * * * *"}))).as_deref(), Some("cron"));
        assert_eq!(schedule_type(&doc(json!({"_type": "daily", "_command": "07:00:00"}))).as_deref(), Some("daily"));
        assert_eq!(schedule_type(&doc(json!({"start": "2024-01-01"}))), None);
    }

    #[test]
    fn test_manager_rejects_unknown_type() {
        let manager = SchedulerManager::with_builtins();
        let err = manager.get_scheduler(&doc(json!({"weekly>": "Mon,07:00:00"})), "UTC").err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownType(t) if t == "weekly"));
    }

    #[test]
    fn test_manager_rejects_unknown_timezone() {
        let manager = SchedulerManager::with_builtins();
        let err = manager.get_scheduler(&doc(json!({"cron>": "* * * * *"})), "Mars/Olympus").err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownTimeZone(_)));
    }

    #[test]
    fn test_manager_resolves_builtin() {
        let manager = SchedulerManager::with_builtins();
        let scheduler = manager.get_scheduler(&doc(json!({"daily>": "07:00:00"})), "Asia/Tokyo").unwrap();
        assert_eq!(scheduler.timezone(), chrono_tz::Asia::Tokyo);
    }
}
