//! Cron-backed schedulers.
//!
//! Every built-in schedule type reduces to a cron pattern plus a delay:
//! `daily>: "07:00:00"` fires at midnight's schedule time with a seven hour
//! run delay, so the session time stays at the start of the day.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use taskflow_types::document::Document;
use taskflow_types::error::ConfigError;
use taskflow_types::schedule::{ScheduleTime, truncate_to_second};

use super::{Scheduler, SchedulerError, SchedulerFactory};

const DELAY_KEY: &str = "_delay";

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

pub struct CronScheduler {
    pattern: String,
    cron: croner::Cron,
    timezone: Tz,
    delay_secs: i64,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl CronScheduler {
    /// `start` is inclusive, `end` exclusive. Both bound the schedule time.
    pub fn new(
        pattern: &str,
        timezone: Tz,
        delay_secs: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, SchedulerError> {
        let cron = pattern
            .parse::<croner::Cron>()
            .map_err(|e| SchedulerError::InvalidCron {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            cron,
            timezone,
            delay_secs,
            start,
            end,
        })
    }

    /// Next matching instant strictly after `after`, evaluated in the
    /// scheduler's time zone.
    fn next(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, false)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SchedulerError::InvalidCron {
                pattern: self.pattern.clone(),
                message: e.to_string(),
            })
    }

    fn is_past_end(&self, schedule_time: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| schedule_time >= end)
    }

    fn to_schedule_time(&self, schedule_time: DateTime<Utc>) -> ScheduleTime {
        if self.is_past_end(schedule_time) {
            let never = ScheduleTime::far_future();
            return ScheduleTime::aligned(never, never);
        }
        ScheduleTime::aligned(schedule_time + Duration::seconds(self.delay_secs), schedule_time)
    }
}

impl Scheduler for CronScheduler {
    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn first_schedule_time(&self, reference: DateTime<Utc>) -> Result<ScheduleTime, SchedulerError> {
        let mut truncated = truncate_to_second(reference);
        if truncated == reference {
            // `next` is exclusive; step back so `reference` itself can match
            truncated -= Duration::seconds(1);
        }
        self.next_schedule_time(truncated - Duration::seconds(self.delay_secs))
    }

    fn next_schedule_time(&self, last_schedule_time: DateTime<Utc>) -> Result<ScheduleTime, SchedulerError> {
        if self.is_past_end(last_schedule_time) {
            return Ok(self.to_schedule_time(last_schedule_time));
        }
        let from = match self.start {
            Some(start) => last_schedule_time.max(start - Duration::seconds(1)),
            None => last_schedule_time,
        };
        Ok(self.to_schedule_time(self.next(from)?))
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

pub(crate) fn builtin_factories() -> Vec<Box<dyn SchedulerFactory>> {
    vec![
        Box::new(CronSchedulerFactory),
        Box::new(DailySchedulerFactory),
        Box::new(HourlySchedulerFactory),
        Box::new(MinutesIntervalSchedulerFactory),
    ]
}

/// `cron>: "0 3 * * *"`
pub struct CronSchedulerFactory;

impl SchedulerFactory for CronSchedulerFactory {
    fn type_name(&self) -> &str {
        "cron"
    }

    fn new_scheduler(&self, config: &Document, timezone: Tz) -> Result<Box<dyn Scheduler>, SchedulerError> {
        let pattern = argument_str(config, self.type_name())?;
        build(&pattern, config, timezone, 0)
    }
}

/// `daily>: "HH:MM[:SS]"`
pub struct DailySchedulerFactory;

impl SchedulerFactory for DailySchedulerFactory {
    fn type_name(&self) -> &str {
        "daily"
    }

    fn new_scheduler(&self, config: &Document, timezone: Tz) -> Result<Box<dyn Scheduler>, SchedulerError> {
        let key = "daily>";
        let (h, m, s) = parse_clock(&argument_str(config, self.type_name())?, key)?;
        if h >= 24 {
            return Err(ConfigError::invalid_value(key, "hour must be less than 24").into());
        }
        build("0 0 * * *", config, timezone, i64::from(h * 3600 + m * 60 + s))
    }
}

/// `hourly>: "MM:SS"`
pub struct HourlySchedulerFactory;

impl SchedulerFactory for HourlySchedulerFactory {
    fn type_name(&self) -> &str {
        "hourly"
    }

    fn new_scheduler(&self, config: &Document, timezone: Tz) -> Result<Box<dyn Scheduler>, SchedulerError> {
        let key = "hourly>";
        let value = argument_str(config, self.type_name())?;
        let fragments: Vec<&str> = value.split(':').collect();
        let [m, s] = fragments.as_slice() else {
            return Err(ConfigError::invalid_value(key, format!("needs MM:SS format: {value}")).into());
        };
        let m = parse_fragment(m, 60, key)?;
        let s = parse_fragment(s, 60, key)?;
        build("0 * * * *", config, timezone, i64::from(m * 60 + s))
    }
}

/// `minutes_interval>: N` fires every N minutes.
pub struct MinutesIntervalSchedulerFactory;

impl SchedulerFactory for MinutesIntervalSchedulerFactory {
    fn type_name(&self) -> &str {
        "minutes_interval"
    }

    fn new_scheduler(&self, config: &Document, timezone: Tz) -> Result<Box<dyn Scheduler>, SchedulerError> {
        let key = "minutes_interval>";
        let minutes = argument_str(config, self.type_name())?
            .parse::<u32>()
            .ok()
            .filter(|n| (1..60).contains(n))
            .ok_or_else(|| ConfigError::invalid_value(key, "must be an integer between 1 and 59"))?;
        build(&format!("*/{minutes} * * * *"), config, timezone, 0)
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn build(pattern: &str, config: &Document, timezone: Tz, delay_secs: i64) -> Result<Box<dyn Scheduler>, SchedulerError> {
    let delay = config.get_optional_i64(DELAY_KEY)?.unwrap_or(0);
    let start = optional_date(config, "start", timezone)?;
    let end = optional_date(config, "end", timezone)?
        .map(|d| d + Duration::days(1));
    Ok(Box::new(CronScheduler::new(pattern, timezone, delay_secs + delay, start, end)?))
}

/// The scheduler argument: the `type>` value, else `_command`.
fn argument_str(config: &Document, type_name: &str) -> Result<String, ConfigError> {
    let key = format!("{type_name}>");
    match config.get(&key).or_else(|| config.get("_command")) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ConfigError::WrongType { key, expected: "a string" }),
        None => Err(ConfigError::MissingKey(key)),
    }
}

/// `YYYY-MM-DD` as local midnight in `timezone`.
fn optional_date(config: &Document, key: &str, timezone: Tz) -> Result<Option<DateTime<Utc>>, ConfigError> {
    let Some(value) = config.get_optional_str(key)? else {
        return Ok(None);
    };
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ConfigError::invalid_value(key, format!("needs YYYY-MM-DD format: {value}")))?;
    resolve_local(timezone, date.and_time(chrono::NaiveTime::MIN))
        .map(Some)
        .ok_or_else(|| ConfigError::invalid_value(key, format!("{value} does not exist in {timezone}")))
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub(crate) fn parse_clock(value: &str, key: &str) -> Result<(u32, u32, u32), ConfigError> {
    let fragments: Vec<&str> = value.split(':').collect();
    let invalid = || ConfigError::invalid_value(key, format!("needs HH:MM or HH:MM:SS format: {value}"));
    match fragments.as_slice() {
        [h, m] => Ok((
            h.parse().map_err(|_| invalid())?,
            parse_fragment(m, 60, key)?,
            0,
        )),
        [h, m, s] => Ok((
            h.parse().map_err(|_| invalid())?,
            parse_fragment(m, 60, key)?,
            parse_fragment(s, 60, key)?,
        )),
        _ => Err(invalid()),
    }
}

fn parse_fragment(fragment: &str, bound: u32, key: &str) -> Result<u32, ConfigError> {
    fragment
        .parse::<u32>()
        .ok()
        .filter(|v| *v < bound)
        .ok_or_else(|| ConfigError::invalid_value(key, format!("'{fragment}' must be an integer below {bound}")))
}

/// Local wall-clock time to an instant. A time inside a DST gap resolves to
/// the first instant after the gap.
pub(crate) fn resolve_local(timezone: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    timezone
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| timezone.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
}
