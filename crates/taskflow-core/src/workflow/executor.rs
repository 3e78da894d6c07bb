//! Session executor: submits compiled workflows and drives their task trees.
//!
//! The executor owns no task state itself. Every decision is re-derived from
//! the store under the per-task lock and applied through [`TaskControl`], so
//! several executors may share one store.
//!
//! # Execution flow
//!
//! 1. `submit_workflow` compiles the definition, creates the session and
//!    inserts the task tree (root first, BLOCKED, then promoted).
//! 2. Each pass of the loop propagates status changes: BLOCKED children of
//!    PLANNED/SUCCESS parents are promoted, PLANNED tasks whose children are
//!    all done are closed.
//! 3. RETRY_WAITING tasks whose `retry_at` passed go back to READY.
//! 4. READY tasks are locked, moved to RUNNING and handed to the dispatcher.
//! 5. Operators report back through [`TaskApi`], which wakes the loop.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use futures_util::StreamExt;
use serde_json::Value;
use taskflow_types::config::ExecutorConfig;
use taskflow_types::document::Document;
use taskflow_types::error::ConfigError;
use taskflow_types::session::{NewSession, SessionStatus, StoredSession};
use taskflow_types::task::{
    Action, NewTask, SessionId, StoredTask, TaskId, TaskOutcome, TaskReport, TaskStateCode,
    TaskStateFlags, error_document,
};
use taskflow_types::workflow::WorkflowDefinition;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::repository::lock::TaskLock;
use crate::repository::session::SessionStore;

use super::compiler::WorkflowCompiler;
use super::dispatch::{TaskApi, TaskQueueDispatcher};
use super::error::ExecutorError;
use super::propagator::StatusPropagator;
use super::retry::RetryControl;
use super::task_control::TaskControl;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Change-feed pages handled per pass before moving on to dispatch.
const MAX_PROPAGATION_PAGES_PER_PASS: usize = 64;

/// Config keys consumed by the engine and hidden from operators.
const ENGINE_ONLY_KEYS: &[&str] = &["_check", "_error"];

// ---------------------------------------------------------------------------
// SessionExecutor
// ---------------------------------------------------------------------------

pub struct SessionExecutor<S: SessionStore> {
    store: Arc<S>,
    config: ExecutorConfig,
    notice: Notify,
    /// READY tasks currently being enqueued by this instance.
    in_flight: DashSet<TaskId>,
    propagator: Mutex<StatusPropagator>,
    scanned: AtomicBool,
}

impl<S: SessionStore> SessionExecutor<S> {
    pub fn new(store: Arc<S>, config: ExecutorConfig) -> Self {
        let propagator = StatusPropagator::new(config.page_size);
        Self {
            store,
            config,
            notice: Notify::new(),
            in_flight: DashSet::new(),
            propagator: Mutex::new(propagator),
            scanned: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Wake the loop. A notice sent while no pass is waiting is kept for the
    /// next wait.
    pub fn notice(&self) {
        self.notice.notify_one();
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Compile `definition` and start a session for it.
    ///
    /// Fails with a repository `Conflict` when a session with the same
    /// `(workflow_name, session_time)` exists.
    pub async fn submit_workflow(
        &self,
        definition: &WorkflowDefinition,
        mut session: NewSession,
    ) -> Result<StoredSession, ExecutorError> {
        let workflow = WorkflowCompiler::compile(&definition.name, &definition.config)?;
        let Some(root) = workflow.tasks.first() else {
            return Err(ConfigError::invalid("workflow has no tasks").into());
        };
        if !session.params.has("timezone") {
            session.params.set("timezone", definition.timezone.clone());
        }

        let stored = self.store.create_session(&session).await?;
        let root_id = self
            .store
            .add_task(&NewTask {
                session_id: stored.id,
                parent_id: None,
                full_name: root.full_name.clone(),
                task_type: root.task_type,
                state: TaskStateCode::Blocked,
                flags: TaskStateFlags::initial(),
                config: root.config.clone(),
            })
            .await?;
        TaskControl::add_initial_tasks_excepting_root(self.store.as_ref(), stored.id, root_id, &workflow.tasks)
            .await?;

        // dependencies are recorded, the root may start now
        let to = if root.is_grouping_only() {
            TaskStateCode::Planned
        } else {
            TaskStateCode::Ready
        };
        self.store.set_state(root_id, TaskStateCode::Blocked, to).await?;

        info!(
            session_id = stored.id,
            workflow = %stored.workflow_name,
            tasks = workflow.tasks.len(),
            "session submitted"
        );
        self.notice();
        Ok(stored)
    }

    /// Request cancellation of every unfinished task of a session.
    pub async fn cancel_session(&self, session_id: SessionId) -> Result<u64, ExecutorError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(ExecutorError::SessionNotFound(session_id));
        }
        let count = self.store.request_cancel_session(session_id).await?;
        info!(session_id, tasks = count, "session cancel requested");
        self.notice();
        Ok(count)
    }

    /// Fail a running session from outside: a `fail>` task named
    /// `^{name}^fail` is added under the root, so the root ends in
    /// GROUP_ERROR once its other children finish. Returns `false` when the
    /// root is no longer running children.
    pub async fn fail_session(&self, session_id: SessionId, name: &str, message: &str) -> Result<bool, ExecutorError> {
        let root = self
            .store
            .get_root_task(session_id)
            .await?
            .ok_or(ExecutorError::SessionNotFound(session_id))?;
        let lock = self.lock_existing_task(root.id).await?;
        let ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());
        if ctl.state() != TaskStateCode::Planned {
            debug!(session_id, state = %ctl.state(), "session root not running, nothing to fail");
            return Ok(false);
        }
        let config = Document::new().with("fail>", message);
        let tasks = WorkflowCompiler::compile_tasks(&ctl.task().full_name, &format!("^{name}^fail"), &config)?;
        let added = ctl.add_generated_subtasks(&tasks, &[]).await?.is_some();
        drop(lock);
        if added {
            warn!(session_id, reason = message, "session marked as failed");
            self.notice();
        }
        Ok(added)
    }

    pub async fn session_status(&self, session_id: SessionId) -> Result<SessionStatus, ExecutorError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(ExecutorError::SessionNotFound(session_id))?;
        let root = self
            .store
            .get_root_task(session_id)
            .await?
            .ok_or(ExecutorError::SessionNotFound(session_id))?;
        let failed_tasks = self
            .store
            .list_session_tasks(session_id)
            .await?
            .into_iter()
            .filter(|t| t.state == TaskStateCode::Error && !t.flags.superseded)
            .map(|t| TaskOutcome {
                id: t.id,
                full_name: t.full_name,
                state: t.state,
                error: t.error,
            })
            .collect();
        Ok(SessionStatus {
            session,
            root_state: root.state,
            done: root.state.is_done(),
            failed_tasks,
        })
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Run passes until `shutdown` is cancelled.
    pub async fn run<D: TaskQueueDispatcher>(
        &self,
        dispatcher: &D,
        shutdown: CancellationToken,
    ) -> Result<(), ExecutorError> {
        self.run_loop(dispatcher, &shutdown, false).await
    }

    /// Run passes until every session's root task is done.
    pub async fn run_until_all_done<D: TaskQueueDispatcher>(&self, dispatcher: &D) -> Result<(), ExecutorError> {
        self.run_loop(dispatcher, &CancellationToken::new(), true).await
    }

    async fn run_loop<D: TaskQueueDispatcher>(
        &self,
        dispatcher: &D,
        shutdown: &CancellationToken,
        until_all_done: bool,
    ) -> Result<(), ExecutorError> {
        let min_wait = Duration::from_millis(self.config.min_wait_ms.max(1));
        let max_wait = Duration::from_millis(self.config.max_wait_ms).max(min_wait);
        let mut wait = min_wait;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if until_all_done && !self.store.has_any_not_done_root().await? {
                break;
            }

            let changed = match self.run_pass(dispatcher).await {
                Ok(changed) => changed,
                Err(e) => {
                    tracing::error!(error = %e, "executor pass failed");
                    false
                }
            };
            wait = if changed { min_wait } else { (wait * 2).min(max_wait) };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notice.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("session executor loop stopped");
        Ok(())
    }

    /// One pass over the store. Returns whether anything changed.
    pub async fn run_pass<D: TaskQueueDispatcher>(&self, dispatcher: &D) -> Result<bool, ExecutorError> {
        let span = info_span!("session_executor.pass");
        async {
            let mut changed = false;
            if !self.scanned.swap(true, Ordering::AcqRel) {
                changed |= self.propagate_all_blocked_to_ready().await?;
                changed |= self.propagate_all_planned_to_done().await?;
            }
            changed |= self.propagate_changes().await?;
            changed |= self.retry_retry_waiting_tasks().await?;
            changed |= self.enqueue_ready_tasks(dispatcher).await?;
            Ok::<bool, ExecutorError>(changed)
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    /// Full scan: promote children of every parent that has BLOCKED children.
    async fn propagate_all_blocked_to_ready(&self) -> Result<bool, ExecutorError> {
        let mut parents = BTreeSet::new();
        let mut last_id = 0;
        loop {
            let page = self
                .store
                .find_tasks_by_state(TaskStateCode::Blocked, last_id, self.config.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            last_id = last.id;
            parents.extend(page.iter().filter_map(|t| t.parent_id));
        }

        let mut changed = false;
        for parent_id in parents {
            changed |= self.promote_children(parent_id).await?;
        }
        Ok(changed)
    }

    /// Full scan: close every PLANNED task whose children are all done.
    async fn propagate_all_planned_to_done(&self) -> Result<bool, ExecutorError> {
        let mut changed = false;
        let mut last_id = 0;
        loop {
            let page = self
                .store
                .find_tasks_by_state(TaskStateCode::Planned, last_id, self.config.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            last_id = last.id;
            for task in &page {
                changed |= self.set_done_from_done_children(task.id).await?;
            }
        }
        Ok(changed)
    }

    /// Follow the change feed and re-evaluate the affected tasks.
    async fn propagate_changes(&self) -> Result<bool, ExecutorError> {
        let mut propagator = self.propagator.lock().await;
        let mut changed = false;
        for _ in 0..MAX_PROPAGATION_PAGES_PER_PASS {
            let Some(candidates) = propagator.next_candidates(self.store.as_ref()).await? else {
                break;
            };
            for parent_id in candidates.parents {
                changed |= self.promote_children(parent_id).await?;
            }
            for task_id in candidates.planned {
                changed |= self.set_done_from_done_children(task_id).await?;
            }
        }
        Ok(changed)
    }

    async fn promote_children(&self, parent_id: TaskId) -> Result<bool, ExecutorError> {
        let Some(lock) = self.store.lock_task(parent_id).await? else {
            return Ok(false);
        };
        if !lock.task.state.can_run_children() {
            return Ok(false);
        }
        let ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());
        let promoted = ctl.try_set_children_blocked_to_ready_or_short_circuit_planned().await?;
        if promoted > 0 {
            debug!(task_id = parent_id, promoted, "children promoted");
        }
        Ok(promoted > 0)
    }

    async fn set_done_from_done_children(&self, task_id: TaskId) -> Result<bool, ExecutorError> {
        let Some(lock) = self.store.lock_task(task_id).await? else {
            return Ok(false);
        };
        if lock.task.state != TaskStateCode::Planned {
            return Ok(false);
        }
        let mut ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());
        self.set_done_from_done_children_locked(&mut ctl).await
    }

    async fn set_done_from_done_children_locked(
        &self,
        ctl: &mut TaskControl<'_, S>,
    ) -> Result<bool, ExecutorError> {
        if !ctl.is_all_children_done().await? {
            return Ok(false);
        }
        let flags = ctl.task().flags;
        if flags.cancel_requested {
            return Ok(ctl.set_to_canceled().await?);
        }
        if flags.delayed_error {
            return Ok(ctl.set_planned_to_error().await?);
        }
        if flags.delayed_group_error {
            return Ok(ctl.set_planned_to_group_error(None).await?);
        }

        let errors = ctl.collect_children_errors().await?;
        if errors.is_empty() {
            return Ok(ctl.set_planned_to_success().await?);
        }

        if let Some(retry) = retry_control(ctl.task(), &ctl.task().state_params) {
            if retry.evaluate() {
                info!(
                    task_id = ctl.id(),
                    full_name = %ctl.task().full_name,
                    retry_count = retry.retry_count(),
                    "retrying group"
                );
                return Ok(ctl
                    .set_planned_to_group_retry_waiting(&retry.next_retry_state_params(), retry.next_retry_interval())
                    .await?);
            }
        }

        let error = propagated_error(&errors);
        if self.add_error_tasks_if_any(ctl, &error).await? {
            Ok(ctl.set_planned_to_planned_with_delayed_group_error(&error).await?)
        } else {
            Ok(ctl.set_planned_to_group_error(Some(&error)).await?)
        }
    }

    async fn retry_retry_waiting_tasks(&self) -> Result<bool, ExecutorError> {
        let count = self.store.try_set_retry_waiting_to_ready(Utc::now()).await?;
        if count > 0 {
            debug!(count, "retry-waiting tasks ready");
        }
        Ok(count > 0)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn enqueue_ready_tasks<D: TaskQueueDispatcher>(&self, dispatcher: &D) -> Result<bool, ExecutorError> {
        let ids: Vec<TaskId> = self
            .store
            .find_all_ready_task_ids(self.config.ready_batch_size)
            .await?
            .into_iter()
            .filter(|id| self.in_flight.insert(*id))
            .collect();
        if ids.is_empty() {
            return Ok(false);
        }

        let concurrency = self.config.dispatch_concurrency.max(1);
        futures_util::stream::iter(ids)
            .for_each_concurrent(concurrency, |task_id| async move {
                if let Err(e) = self.enqueue_task(dispatcher, task_id).await {
                    warn!(task_id, error = %e, "failed to enqueue task");
                }
                self.in_flight.remove(&task_id);
            })
            .await;
        Ok(true)
    }

    async fn enqueue_task<D: TaskQueueDispatcher>(&self, dispatcher: &D, task_id: TaskId) -> Result<(), ExecutorError> {
        let span = info_span!("task.enqueue", task_id);
        async {
            let Some(lock) = self.store.lock_task(task_id).await? else {
                return Ok(());
            };
            if lock.task.state != TaskStateCode::Ready {
                return Ok(());
            }
            let mut ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());

            if ctl.task().flags.cancel_requested {
                ctl.set_to_canceled().await?;
                return Ok(());
            }

            if ctl.task().is_grouping_only() {
                // group retry: a fresh generation of children waits under the task
                let copied = ctl.copy_initial_tasks_for_retry().await?;
                debug!(task_id, copied, "group children re-inserted");
                ctl.set_ready_to_planned().await?;
                return Ok(());
            }

            let session = self
                .store
                .get_session(ctl.task().session_id)
                .await?
                .ok_or(ExecutorError::SessionNotFound(ctl.task().session_id))?;

            if let Some(report) = session.options.skip_task_reports.get(&ctl.task().full_name) {
                info!(task_id, full_name = %ctl.task().full_name, "task skipped with stored report");
                ctl.set_ready_to_short_circuit_success(report).await?;
                return Ok(());
            }

            let tasks = self.store.list_session_tasks(session.id).await?;
            let action = build_action(ctl.task(), &session, &tasks);

            if !ctl.set_ready_to_running().await? {
                return Ok(());
            }
            if let Err(e) = dispatcher.dispatch(action).await {
                warn!(task_id, error = %e, "dispatch failed");
                let state_params = ctl.task().state_params.clone();
                self.task_failed_locked(&mut ctl, error_document(e.to_string()), &state_params, None)
                    .await?;
            }
            Ok::<(), ExecutorError>(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Result handling (task lock held)
    // -----------------------------------------------------------------------

    async fn task_succeeded_locked(
        &self,
        ctl: &mut TaskControl<'_, S>,
        state_params: &Document,
        subtask_config: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> Result<bool, ExecutorError> {
        if ctl.state() != TaskStateCode::Running {
            return Ok(false);
        }
        if ctl.task().flags.cancel_requested {
            return Ok(ctl.set_to_canceled().await?);
        }

        let added = match self.add_generated_tasks(ctl, subtask_config).await {
            Ok(added) => added,
            Err(ExecutorError::Config(e)) => {
                warn!(task_id = ctl.id(), error = %e, "invalid generated tasks");
                return self
                    .task_failed_locked(ctl, error_document(e.to_string()), state_params, None)
                    .await;
            }
            Err(e) => return Err(e),
        };

        if added {
            Ok(ctl
                .set_running_to_planned_successful(state_params, carry_params, report)
                .await?)
        } else {
            Ok(ctl
                .set_running_to_short_circuit_success(state_params, carry_params, report)
                .await?)
        }
    }

    /// Insert `^sub` from the operator's output and `^check` from the task's
    /// `_check`, the check running after the subtasks.
    async fn add_generated_tasks(
        &self,
        ctl: &TaskControl<'_, S>,
        subtask_config: &Document,
    ) -> Result<bool, ExecutorError> {
        let full_name = ctl.task().full_name.clone();
        let check = ctl.task().config.get_nested_or_empty("_check")?;

        // Compile both before inserting either, so a bad fragment leaves no
        // rows behind under a task that is about to fail.
        let sub_tasks = match subtask_config.is_empty() {
            true => Vec::new(),
            false => WorkflowCompiler::compile_tasks(&full_name, "^sub", subtask_config)?,
        };
        let check_tasks = match check.is_empty() {
            true => Vec::new(),
            false => WorkflowCompiler::compile_tasks(&full_name, "^check", &check)?,
        };

        let mut upstreams = Vec::new();
        if let Some(id) = ctl.add_generated_subtasks(&sub_tasks, &[]).await? {
            upstreams.push(id);
        }
        if let Some(id) = ctl.add_generated_subtasks(&check_tasks, &upstreams).await? {
            upstreams.push(id);
        }
        Ok(!upstreams.is_empty())
    }

    async fn task_failed_locked(
        &self,
        ctl: &mut TaskControl<'_, S>,
        error: Document,
        state_params: &Document,
        retry_interval: Option<u32>,
    ) -> Result<bool, ExecutorError> {
        if ctl.state() != TaskStateCode::Running {
            return Ok(false);
        }
        if ctl.task().flags.cancel_requested {
            return Ok(ctl.set_to_canceled().await?);
        }

        let mut params = ctl.task().state_params.clone();
        params.merge(state_params);

        if let Some(interval) = retry_interval {
            return Ok(ctl.set_running_to_retry_waiting(&params, interval, Some(&error)).await?);
        }

        if let Some(retry) = retry_control(ctl.task(), &params) {
            if retry.evaluate() {
                info!(
                    task_id = ctl.id(),
                    full_name = %ctl.task().full_name,
                    retry_count = retry.retry_count(),
                    "retrying task"
                );
                return Ok(ctl
                    .set_running_to_retry_waiting(
                        &retry.next_retry_state_params(),
                        retry.next_retry_interval(),
                        Some(&error),
                    )
                    .await?);
            }
        }

        if self.add_error_tasks_if_any(ctl, &error).await? {
            Ok(ctl.set_running_to_planned_with_delayed_error(&params, &error).await?)
        } else {
            Ok(ctl.set_running_to_short_circuit_error(&params, &error).await?)
        }
    }

    /// Insert the task's `_error` subtree as `^error`, exporting `error`.
    async fn add_error_tasks_if_any(
        &self,
        ctl: &TaskControl<'_, S>,
        error: &Document,
    ) -> Result<bool, ExecutorError> {
        let mut config = match ctl.task().config.get_nested_or_empty("_error") {
            Ok(config) => config,
            Err(e) => {
                warn!(task_id = ctl.id(), error = %e, "ignoring invalid _error");
                return Ok(false);
            }
        };
        if config.is_empty() {
            return Ok(false);
        }
        let mut export = config.get_nested_or_empty("_export").unwrap_or_default();
        export.set("error", error.clone().into_value());
        config.set("_export", export.into_value());

        let tasks = match WorkflowCompiler::compile_tasks(&ctl.task().full_name, "^error", &config) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(task_id = ctl.id(), error = %e, "ignoring invalid _error");
                return Ok(false);
            }
        };
        Ok(ctl.add_generated_subtasks(&tasks, &[]).await?.is_some())
    }

    async fn task_poll_next_locked(
        &self,
        ctl: &mut TaskControl<'_, S>,
        state_params: &Document,
        retry_interval_secs: u32,
    ) -> Result<bool, ExecutorError> {
        if ctl.state() != TaskStateCode::Running {
            return Ok(false);
        }
        if ctl.task().flags.cancel_requested {
            return Ok(ctl.set_to_canceled().await?);
        }
        Ok(ctl
            .set_running_to_retry_waiting(state_params, retry_interval_secs, None)
            .await?)
    }

    async fn lock_existing_task(&self, task_id: TaskId) -> Result<TaskLock<'_>, ExecutorError> {
        self.store
            .lock_task(task_id)
            .await?
            .ok_or(ExecutorError::TaskNotFound(task_id))
    }
}

/// `_retry` of `task` evaluated against `state_params`. An invalid `_retry`
/// disables retrying.
fn retry_control(task: &StoredTask, state_params: &Document) -> Option<RetryControl> {
    match RetryControl::prepare(&task.config, state_params, false) {
        Ok(retry) => Some(retry),
        Err(e) => {
            warn!(task_id = task.id, full_name = %task.full_name, error = %e, "ignoring invalid _retry");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// TaskApi
// ---------------------------------------------------------------------------

impl<S: SessionStore> TaskApi for SessionExecutor<S> {
    async fn task_succeeded(
        &self,
        task_id: TaskId,
        state_params: Document,
        subtask_config: Document,
        carry_params: Document,
        report: TaskReport,
    ) -> Result<bool, ExecutorError> {
        let lock = self.lock_existing_task(task_id).await?;
        let mut ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());
        let changed = self
            .task_succeeded_locked(&mut ctl, &state_params, &subtask_config, &carry_params, &report)
            .await?;
        drop(lock);
        if changed {
            self.notice();
        }
        Ok(changed)
    }

    async fn task_failed(
        &self,
        task_id: TaskId,
        error: Document,
        state_params: Document,
        retry_interval: Option<u32>,
    ) -> Result<bool, ExecutorError> {
        let lock = self.lock_existing_task(task_id).await?;
        let mut ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());
        let changed = self
            .task_failed_locked(&mut ctl, error, &state_params, retry_interval)
            .await?;
        drop(lock);
        if changed {
            self.notice();
        }
        Ok(changed)
    }

    async fn task_poll_next(
        &self,
        task_id: TaskId,
        state_params: Document,
        retry_interval_secs: u32,
    ) -> Result<bool, ExecutorError> {
        let lock = self.lock_existing_task(task_id).await?;
        let mut ctl = TaskControl::new(self.store.as_ref(), lock.task.clone());
        let changed = self
            .task_poll_next_locked(&mut ctl, &state_params, retry_interval_secs)
            .await?;
        drop(lock);
        if changed {
            self.notice();
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Parameter collection
// ---------------------------------------------------------------------------

/// Error propagated to a failed group: the first child error plus all of them.
fn propagated_error(errors: &[Document]) -> Document {
    let mut error = errors.first().cloned().unwrap_or_default();
    let all: Vec<Value> = errors.iter().map(|e| e.clone().into_value()).collect();
    error.set("errors", Value::Array(all));
    error
}

/// Render the dispatch request of `task`.
///
/// Parameters are layered from the session params down the ancestor chain:
/// for each node, the carry params of its successful upstream subtrees, then
/// its `_export`, then (for ancestors) its own carry params. The task's own
/// `_export` is applied last.
fn build_action(task: &StoredTask, session: &StoredSession, all: &[StoredTask]) -> Action {
    let by_id: HashMap<TaskId, &StoredTask> = all.iter().map(|t| (t.id, t)).collect();

    let mut chain = vec![task];
    let mut cursor = task.parent_id;
    while let Some(parent_id) = cursor {
        let Some(parent) = by_id.get(&parent_id) else { break };
        chain.push(parent);
        cursor = parent.parent_id;
    }
    chain.reverse();

    let mut params = session.params.clone();
    for node in &chain {
        let mut upstreams = node.upstreams.clone();
        upstreams.sort_unstable();
        for upstream in upstreams {
            for t in subtree(all, upstream) {
                if t.state == TaskStateCode::Success {
                    params.merge(&t.carry_params);
                }
            }
        }
        if let Ok(export) = node.config.get_nested_or_empty("_export") {
            params.merge(&export);
        }
        if node.id != task.id {
            params.merge(&node.carry_params);
        }
    }
    if let Ok(export) = task.config.get_nested_or_empty("_export") {
        params.merge(&export);
    }

    let mut config = task.config.clone();
    for key in ENGINE_ONLY_KEYS {
        config.remove(key);
    }

    Action {
        task_id: task.id,
        site_id: session.site_id,
        full_name: task.full_name.clone(),
        config,
        params,
        state_params: task.state_params.clone(),
    }
}

/// `root` and its current-generation descendants, ordered by id.
fn subtree(all: &[StoredTask], root: TaskId) -> Vec<&StoredTask> {
    let mut members = BTreeSet::from([root]);
    let mut out = Vec::new();
    for t in all {
        let member = t.id == root || t.parent_id.is_some_and(|p| members.contains(&p));
        if member && !t.flags.superseded {
            members.insert(t.id);
            out.push(t);
        }
    }
    out
}
