//! SLA driver.
//!
//! An SLA row monitors the workflow schedule row of the same workflow. Its
//! `next_schedule_time` is the schedule time of the monitored session and its
//! `next_run_time` is that session's deadline. When the deadline passes and
//! the session has not succeeded, the SLA is missed: a warning is logged and
//! the `+` tasks of the `sla:` config run as a `<workflow>^sla` session.
//! With `fail: true` the late session itself is failed as well.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use taskflow_types::config::ScheduleConfig;
use taskflow_types::error::RepositoryError;
use taskflow_types::schedule::{NewSchedule, ScheduleKind, ScheduleTime, StoredSchedule};
use taskflow_types::session::NewSession;
use taskflow_types::workflow::WorkflowDefinition;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::repository::schedule::{ScheduleStore, ScheduleUpdate};
use crate::repository::session::SessionStore;
use crate::workflow::error::ExecutorError;
use crate::workflow::executor::SessionExecutor;

use super::executor::postponed;
use super::sla::{SlaCalculator, SlaTrigger};
use super::{Scheduler, SchedulerError, SchedulerManager};

/// Workflow triggers examined while looking for one with a deadline.
const MAX_SLA_LOOKAHEAD: usize = 1000;

const SLA_VIOLATION: &str = "SLA violation";

pub struct SlaExecutor<S: SessionStore, R: ScheduleStore> {
    sessions: Arc<SessionExecutor<S>>,
    schedules: Arc<R>,
    schedulers: Arc<SchedulerManager>,
    config: ScheduleConfig,
}

impl<S: SessionStore, R: ScheduleStore> SlaExecutor<S, R> {
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

    /// SLA row for a workflow whose first trigger is `first`, or `None`
    /// when the workflow has no `sla:`.
    pub fn sla_schedule(
        definition: &WorkflowDefinition,
        scheduler: &dyn Scheduler,
        first: ScheduleTime,
    ) -> Result<Option<NewSchedule>, SchedulerError> {
        let sla = definition.config.get_nested_or_empty("sla")?;
        if sla.is_empty() {
            return Ok(None);
        }
        let trigger = SlaCalculator::parse(&sla)?;
        let next = next_sla_time(trigger, scheduler, first)?;
        Ok(Some(NewSchedule {
            workflow_name: definition.name.clone(),
            kind: ScheduleKind::Sla,
            config: sla,
            timezone: definition.timezone.clone(),
            next,
        }))
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            return;
        }
        let interval = StdDuration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            loop {
                match self.run_sla_once(Utc::now()).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "sla pass failed, will retry");
                        break;
                    }
                }
            }
        }
    }

    /// Check at most one SLA whose deadline has passed.
    pub async fn run_sla_once(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let span = info_span!("sla.run");
        let count = self
            .schedules
            .lock_ready_schedules(ScheduleKind::Sla, now, 1, |row| self.run_sla(row))
            .instrument(span)
            .await?;
        Ok(count)
    }

    async fn run_sla(&self, row: StoredSchedule) -> ScheduleUpdate {
        match self.check_sla(&row).await {
            Ok(update) => update,
            Err(e) => {
                error!(
                    workflow = %row.workflow_name,
                    schedule_time = %row.next_schedule_time,
                    error = %e,
                    "error during sla check, postponing for 1 hour"
                );
                postponed(&row)
            }
        }
    }

    async fn check_sla(&self, row: &StoredSchedule) -> Result<ScheduleUpdate, SchedulerError> {
        let trigger = SlaCalculator::parse(&row.config)?;
        let monitored = row.next_schedule_time;

        let session = self
            .sessions
            .store()
            .find_session_by_time(&row.workflow_name, monitored)
            .await?;
        let succeeded = match &session {
            Some(session) => self.sessions.session_status(session.id).await?.is_success(),
            None => false,
        };
        if succeeded {
            debug!(workflow = %row.workflow_name, schedule_time = %monitored, "sla met");
        } else {
            warn!(
                workflow = %row.workflow_name,
                schedule_time = %monitored,
                deadline = %row.next_run_time,
                alert = SlaCalculator::alert(&row.config),
                "SLA missed"
            );
            if let Some(session) = session.filter(|_| SlaCalculator::fail(&row.config)) {
                self.sessions.fail_session(session.id, "sla", SLA_VIOLATION).await?;
            }
            self.run_sla_tasks(row).await?;
        }

        let Some(workflow_row) = self
            .schedules
            .get_schedule(&row.workflow_name, ScheduleKind::Workflow)
            .await?
        else {
            let far = ScheduleTime::far_future();
            return Ok(ScheduleUpdate {
                next: ScheduleTime::aligned(far, far),
                last_session_time: Some(monitored),
            });
        };
        let schedule_config = workflow_row.config.get_nested_or_empty("schedule")?;
        let scheduler = self.schedulers.get_scheduler(&schedule_config, &workflow_row.timezone)?;
        let following = scheduler.next_schedule_time(monitored)?;
        Ok(ScheduleUpdate {
            next: next_sla_time(trigger, scheduler.as_ref(), following)?,
            last_session_time: Some(monitored),
        })
    }

    async fn run_sla_tasks(&self, row: &StoredSchedule) -> Result<(), SchedulerError> {
        let tasks = SlaCalculator::tasks(&row.config);
        if tasks.is_empty() {
            return Ok(());
        }
        let definition = WorkflowDefinition {
            name: format!("{}^sla", row.workflow_name),
            config: tasks,
            timezone: row.timezone.clone(),
        };
        let session = NewSession::new(0, &definition.name).with_session_time(row.next_schedule_time);
        match self.sessions.submit_workflow(&definition, session).await {
            Ok(stored) => {
                info!(workflow = %definition.name, session_id = stored.id, "sla tasks started");
                Ok(())
            }
            Err(ExecutorError::Repository(RepositoryError::Conflict(_))) => {
                debug!(workflow = %definition.name, "sla tasks already started");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Deadline of the first workflow trigger at or after `workflow_time` that
/// has one. Deadlines are always strictly after the monitored run time.
pub fn next_sla_time(
    trigger: SlaTrigger,
    scheduler: &dyn Scheduler,
    mut workflow_time: ScheduleTime,
) -> Result<ScheduleTime, SchedulerError> {
    let far = ScheduleTime::far_future();
    for _ in 0..MAX_SLA_LOOKAHEAD {
        if workflow_time.run_time() >= far {
            return Ok(ScheduleTime::aligned(far, far));
        }
        if let Some(deadline) = SlaCalculator::same_day_deadline(trigger, workflow_time.run_time(), scheduler.timezone()) {
            return Ok(ScheduleTime::aligned(deadline, workflow_time.schedule_time()));
        }
        workflow_time = scheduler.next_schedule_time(workflow_time.schedule_time())?;
    }
    Err(SchedulerError::Config(taskflow_types::error::ConfigError::invalid(
        "sla deadline never falls after a scheduled run",
    )))
}
