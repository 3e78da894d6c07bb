//! Schedule driver: starts sessions of scheduled workflows.
//!
//! Every poll interval the driver takes the due workflow schedule rows one at
//! a time, submits a session whose `session_time` is the row's schedule time
//! and writes back the next trigger. The write-back is conditional on the
//! row's previous run time and sessions are unique per
//! `(workflow_name, session_time)`, so concurrent drivers neither skip nor
//! duplicate a trigger.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use taskflow_types::config::ScheduleConfig;
use taskflow_types::document::Document;
use taskflow_types::error::{ConfigError, RepositoryError};
use taskflow_types::schedule::{NewSchedule, ScheduleKind, ScheduleTime, StoredSchedule};
use taskflow_types::session::NewSession;
use taskflow_types::workflow::WorkflowDefinition;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::repository::schedule::{ScheduleStore, ScheduleUpdate};
use crate::repository::session::SessionStore;
use crate::workflow::error::ExecutorError;
use crate::workflow::executor::SessionExecutor;

use super::sla_executor::SlaExecutor;
use super::{SchedulerError, SchedulerManager};

/// A failed start is retried after this delay.
const POSTPONE_ON_ERROR_SECS: i64 = 3600;

/// Rows handled per store round trip.
const ROWS_PER_LOCK: u32 = 1;

pub struct ScheduleExecutor<S: SessionStore, R: ScheduleStore> {
    sessions: Arc<SessionExecutor<S>>,
    schedules: Arc<R>,
    schedulers: Arc<SchedulerManager>,
    config: ScheduleConfig,
}

impl<S: SessionStore, R: ScheduleStore> ScheduleExecutor<S, R> {
    pub fn new(
        sessions: Arc<SessionExecutor<S>>,
        schedules: Arc<R>,
        schedulers: Arc<SchedulerManager>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            sessions,
            schedules,
            schedulers,
            config,
        }
    }

    /// Create or replace the schedule rows of a workflow. A workflow without
    /// `schedule:` loses its rows. Returns the workflow schedule row.
    pub async fn register_workflow(
        &self,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredSchedule>, SchedulerError> {
        let schedule_config = definition.config.get_nested_or_empty("schedule")?;
        if schedule_config.is_empty() {
            let removed = self.schedules.delete_schedules(&definition.name).await?;
            if removed > 0 {
                info!(workflow = %definition.name, removed, "schedule removed");
            }
            return Ok(None);
        }

        let scheduler = self.schedulers.get_scheduler(&schedule_config, &definition.timezone)?;
        let first = scheduler.first_schedule_time(now)?;
        let sla = SlaExecutor::<S, R>::sla_schedule(definition, scheduler.as_ref(), first)?;

        let stored = self
            .schedules
            .upsert_schedule(&NewSchedule {
                workflow_name: definition.name.clone(),
                kind: ScheduleKind::Workflow,
                config: definition.config.clone(),
                timezone: definition.timezone.clone(),
                next: first,
            })
            .await?;
        if let Some(sla) = sla {
            self.schedules.upsert_schedule(&sla).await?;
        }

        info!(
            workflow = %definition.name,
            next_run_time = %stored.next_run_time,
            next_schedule_time = %stored.next_schedule_time,
            "schedule registered"
        );
        Ok(Some(stored))
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Poll until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            debug!("scheduler is disabled");
            return;
        }
        let interval = StdDuration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.run_schedules(Utc::now()).await;
        }
    }

    /// Handle due rows until none is left. Returns the number handled.
    pub async fn run_schedules(&self, now: DateTime<Utc>) -> usize {
        let mut total = 0;
        loop {
            match self.run_schedule_once(now).await {
                Ok(0) => break,
                Ok(count) => total += count,
                Err(e) => {
                    error!(error = %e, "schedule pass failed, will retry");
                    break;
                }
            }
        }
        total
    }

    /// Lock and handle at most one due row.
    pub async fn run_schedule_once(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let span = info_span!("schedule.run");
        let count = self
            .schedules
            .lock_ready_schedules(ScheduleKind::Workflow, now, ROWS_PER_LOCK, |row| self.run_schedule(row, now))
            .instrument(span)
            .await?;
        Ok(count)
    }

    async fn run_schedule(&self, row: StoredSchedule, now: DateTime<Utc>) -> ScheduleUpdate {
        match self.start_schedule(&row, now).await {
            Ok(update) => update,
            Err(e) => {
                error!(
                    workflow = %row.workflow_name,
                    schedule_time = %row.next_schedule_time,
                    error = %e,
                    "error during scheduling, postponing for 1 hour"
                );
                postponed(&row)
            }
        }
    }

    async fn start_schedule(&self, row: &StoredSchedule, now: DateTime<Utc>) -> Result<ScheduleUpdate, SchedulerError> {
        let schedule_config = row.config.get_nested_or_empty("schedule")?;
        let scheduler = self.schedulers.get_scheduler(&schedule_config, &row.timezone)?;
        let next = scheduler.next_schedule_time(row.next_schedule_time)?;

        if let Some(skip) = skip_delayed_by(&schedule_config)? {
            if now > row.next_run_time + skip {
                info!(
                    workflow = %row.workflow_name,
                    schedule_time = %row.next_schedule_time,
                    "too late for the scheduled time, skipping"
                );
                return Ok(ScheduleUpdate {
                    next,
                    last_session_time: None,
                });
            }
        }

        let definition = WorkflowDefinition {
            name: row.workflow_name.clone(),
            config: row.config.clone(),
            timezone: row.timezone.clone(),
        };
        let mut session = NewSession::new(0, &row.workflow_name).with_session_time(row.next_schedule_time);
        if let Some(last) = row.last_session_time {
            session.params.set("last_session_time", last.to_rfc3339());
        }

        match self.sessions.submit_workflow(&definition, session).await {
            Ok(stored) => info!(
                workflow = %row.workflow_name,
                session_id = stored.id,
                session_time = %row.next_schedule_time,
                "scheduled session started"
            ),
            Err(ExecutorError::Repository(RepositoryError::Conflict(_))) => debug!(
                workflow = %row.workflow_name,
                session_time = %row.next_schedule_time,
                "scheduled session already exists"
            ),
            Err(e) => return Err(e.into()),
        }

        Ok(ScheduleUpdate {
            next,
            last_session_time: Some(row.next_schedule_time),
        })
    }
}

/// Same schedule time, run again one hour from now.
pub(crate) fn postponed(row: &StoredSchedule) -> ScheduleUpdate {
    ScheduleUpdate {
        next: ScheduleTime::aligned(
            ScheduleTime::aligned_now() + Duration::seconds(POSTPONE_ON_ERROR_SECS),
            row.next_schedule_time,
        ),
        last_session_time: None,
    }
}

/// `skip_delayed_by`: seconds, or a number with an `s`/`m`/`h`/`d` suffix.
fn skip_delayed_by(config: &Document) -> Result<Option<Duration>, ConfigError> {
    let key = "skip_delayed_by";
    let invalid = |v: &str| ConfigError::invalid_value(key, format!("expected a duration like 30m, got '{v}'"));
    match config.get(key) {
        None => Ok(None),
        Some(Value::Number(_)) => Ok(config.get_optional_i64(key)?.map(Duration::seconds)),
        Some(Value::String(s)) => {
            let s = s.trim();
            let (number, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
            let n: i64 = number.parse().map_err(|_| invalid(s))?;
            let d = match unit.trim() {
                "" | "s" => Duration::seconds(n),
                "m" => Duration::minutes(n),
                "h" => Duration::hours(n),
                "d" => Duration::days(n),
                _ => return Err(invalid(s)),
            };
            Ok(Some(d))
        }
        Some(_) => Err(ConfigError::WrongType {
            key: key.to_string(),
            expected: "a duration",
        }),
    }
}
