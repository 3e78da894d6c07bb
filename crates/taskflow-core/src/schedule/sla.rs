//! SLA deadlines.
//!
//! `sla: {time: "HH:MM[:SS]"}` is a wall-clock deadline on the day of the
//! monitored run; `sla: {duration: "HH:MM[:SS]"}` is relative to the run.
//! Keys starting with `+` are the tasks run when the deadline passes.
//! `fail: true` also fails the late session; `alert` flags the miss.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use taskflow_types::document::Document;
use taskflow_types::error::ConfigError;

use super::cron::{parse_clock, resolve_local};

const KNOWN_KEYS: &[&str] = &["time", "duration", "fail", "alert"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaTrigger {
    /// Local time of day.
    Time(NaiveTime),
    Duration(Duration),
}

pub struct SlaCalculator;

impl SlaCalculator {
    /// Parse and validate an `sla:` config.
    pub fn parse(config: &Document) -> Result<SlaTrigger, ConfigError> {
        let unknown: Vec<String> = config
            .keys()
            .filter(|k| !k.starts_with('+') && !KNOWN_KEYS.contains(&k.as_str()))
            .map(|k| format!("'{k}'"))
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::invalid(format!(
                "sla contains invalid keys: {}",
                unknown.join(", ")
            )));
        }

        config.get_bool_or("fail", false)?;
        config.get_bool_or("alert", false)?;

        let time = config.get_optional_str("time")?;
        let duration = config.get_optional_str("duration")?;
        match (time, duration) {
            (Some(time), None) => {
                let (h, m, s) = parse_clock(time, "time")?;
                NaiveTime::from_hms_opt(h, m, s)
                    .map(SlaTrigger::Time)
                    .ok_or_else(|| ConfigError::invalid_value("time", format!("{time} is not a time of day")))
            }
            (None, Some(duration)) => {
                let (h, m, s) = parse_clock(duration, "duration")?;
                let d = Duration::seconds(i64::from(h) * 3600 + i64::from(m) * 60 + i64::from(s));
                if d <= Duration::zero() {
                    return Err(ConfigError::invalid_value("duration", "must be positive"));
                }
                Ok(SlaTrigger::Duration(d))
            }
            _ => Err(ConfigError::invalid(
                "SLA must be specified using either the 'time' or 'duration' option",
            )),
        }
    }

    /// Deadline on the local date of `run_time`, `None` when it is not
    /// strictly after `run_time`.
    pub fn same_day_deadline(trigger: SlaTrigger, run_time: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
        match trigger {
            SlaTrigger::Duration(d) => Some(run_time + d),
            SlaTrigger::Time(time) => {
                let date = run_time.with_timezone(&timezone).date_naive();
                resolve_local(timezone, date.and_time(time)).filter(|deadline| *deadline > run_time)
            }
        }
    }

    /// The `+` task entries of an SLA config.
    pub fn tasks(config: &Document) -> Document {
        let mut tasks = Document::new();
        for (key, value) in config.iter().filter(|(k, _)| k.starts_with('+')) {
            tasks.set(key.clone(), value.clone());
        }
        tasks
    }

    pub fn alert(config: &Document) -> bool {
        config.get_bool_or("alert", false).unwrap_or(false)
    }

    /// Whether a missed deadline fails the monitored session.
    pub fn fail(config: &Document) -> bool {
        config.get_bool_or("fail", false).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_time_and_duration() {
        assert_eq!(
            SlaCalculator::parse(&doc(json!({"time": "09:30"}))).unwrap(),
            SlaTrigger::Time(NaiveTime::from_hms_opt(9, 30, 0).unwrap())
        );
        assert_eq!(
            SlaCalculator::parse(&doc(json!({"duration": "01:00:30"}))).unwrap(),
            SlaTrigger::Duration(Duration::seconds(3630))
        );
    }

    #[test]
    fn test_parse_rejects_ambiguous_or_unknown() {
        assert!(SlaCalculator::parse(&doc(json!({"time": "09:00", "duration": "01:00"}))).is_err());
        assert!(SlaCalculator::parse(&doc(json!({}))).is_err());
        let err = SlaCalculator::parse(&doc(json!({"time": "09:00", "tiem": "x"}))).unwrap_err();
        assert!(err.to_string().contains("'tiem'"));
        assert!(SlaCalculator::parse(&doc(json!({"time": "25:00"}))).is_err());
    }

    #[test]
    fn test_duration_deadline() {
        let trigger = SlaCalculator::parse(&doc(json!({"duration": "00:30"}))).unwrap();
        let run = at("2024-01-01T23:50:00Z");
        assert_eq!(SlaCalculator::same_day_deadline(trigger, run, Tz::UTC), Some(at("2024-01-02T00:20:00Z")));
    }

    #[test]
    fn test_time_deadline_in_timezone() {
        let trigger = SlaCalculator::parse(&doc(json!({"time": "09:00"}))).unwrap();
        assert_eq!(
            SlaCalculator::same_day_deadline(trigger, at("2024-01-01T15:00:00Z"), chrono_tz::Asia::Tokyo),
            Some(at("2024-01-02T00:00:00Z"))
        );
        assert_eq!(SlaCalculator::same_day_deadline(trigger, at("2024-01-01T01:00:00Z"), chrono_tz::Asia::Tokyo), None);
    }

    #[test]
    fn test_fail_and_alert_flags() {
        let config = doc(json!({"time": "09:00", "fail": true}));
        assert!(SlaCalculator::parse(&config).is_ok());
        assert!(SlaCalculator::fail(&config));
        assert!(!SlaCalculator::alert(&config));

        assert!(SlaCalculator::parse(&doc(json!({"time": "09:00", "fail": "yes please"}))).is_err());
    }

    #[test]
    fn test_tasks_and_alert() {
        let config = doc(json!({"time": "09:00", "alert": true, "+notify": {"echo>": "late"}}));
        assert!(SlaCalculator::alert(&config));
        assert!(!SlaCalculator::fail(&config));
        assert_eq!(SlaCalculator::tasks(&config).keys().collect::<Vec<_>>(), vec!["+notify"]);
    }
}
