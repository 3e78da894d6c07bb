//! Schedule rows and trigger times.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::ConfigError;

pub type ScheduleId = i64;

/// Next trigger of a schedule.
///
/// `run_time` is the wall-clock instant at which the trigger fires and is
/// aligned to the second. `schedule_time` is the logical session time handed
/// to the new session and is aligned to the minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTime {
    run_time: DateTime<Utc>,
    schedule_time: DateTime<Utc>,
}

impl ScheduleTime {
    pub fn new(run_time: DateTime<Utc>, schedule_time: DateTime<Utc>) -> Result<Self, ConfigError> {
        if run_time.nanosecond() != 0 {
            return Err(ConfigError::invalid(format!(
                "run time {run_time} is not aligned to a second"
            )));
        }
        if schedule_time.second() != 0 || schedule_time.nanosecond() != 0 {
            return Err(ConfigError::invalid(format!(
                "schedule time {schedule_time} is not aligned to a minute"
            )));
        }
        Ok(Self {
            run_time,
            schedule_time,
        })
    }

    /// Build a schedule time, truncating both instants to their alignment.
    pub fn aligned(run_time: DateTime<Utc>, schedule_time: DateTime<Utc>) -> Self {
        Self {
            run_time: truncate_to_second(run_time),
            schedule_time: truncate_to_minute(schedule_time),
        }
    }

    pub fn run_time(&self) -> DateTime<Utc> {
        self.run_time
    }

    pub fn schedule_time(&self) -> DateTime<Utc> {
        self.schedule_time
    }

    /// Current time truncated to the second.
    pub fn aligned_now() -> DateTime<Utc> {
        truncate_to_second(Utc::now())
    }

    /// Instant used as run time for schedules that must never fire again.
    pub fn far_future() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}

pub fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let t = truncate_to_second(t);
    t.with_second(0).unwrap_or(t)
}

/// Schedule flavor. SLA rows monitor a workflow schedule instead of starting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Workflow,
    Sla,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Workflow => "workflow",
            ScheduleKind::Sla => "sla",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(ScheduleKind::Workflow),
            "sla" => Some(ScheduleKind::Sla),
            _ => None,
        }
    }
}

/// A schedule about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub workflow_name: String,
    pub kind: ScheduleKind,
    /// Workflow definition config (workflow rows) or SLA config (SLA rows).
    pub config: Document,
    pub timezone: String,
    pub next: ScheduleTime,
}

/// A persisted schedule row. Unique per `(workflow_name, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSchedule {
    pub id: ScheduleId,
    pub workflow_name: String,
    pub kind: ScheduleKind,
    pub config: Document,
    pub timezone: String,
    pub next_run_time: DateTime<Utc>,
    pub next_schedule_time: DateTime<Utc>,
    pub last_session_time: Option<DateTime<Utc>>,
}
