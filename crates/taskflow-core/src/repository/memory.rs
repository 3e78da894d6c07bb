//! In-memory store implementations.
//!
//! Used by unit tests and by `tflow run --in-memory`. Every operation runs
//! under one async mutex, which trivially makes each conditional update
//! atomic.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use taskflow_types::document::Document;
use taskflow_types::error::RepositoryError;
use taskflow_types::schedule::{NewSchedule, ScheduleId, ScheduleKind, StoredSchedule};
use taskflow_types::session::{NewSession, StoredSession};
use taskflow_types::task::{
    NewTask, NewTreeTask, SessionId, StoredTask, TaskId, TaskRef, TaskReport, TaskStateCode,
    TaskStateFlags, TaskStateSummary, TaskType, error_document,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::lock::{TaskLock, TaskLocks};
use super::schedule::{ScheduleStore, ScheduleUpdate};
use super::session::SessionStore;

// ---------------------------------------------------------------------------
// Sessions and tasks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionTables {
    next_session_id: SessionId,
    next_task_id: TaskId,
    change_seq: i64,
    sessions: BTreeMap<SessionId, StoredSession>,
    tasks: BTreeMap<TaskId, StoredTask>,
}

impl SessionTables {
    fn touch(&mut self, id: TaskId) {
        self.change_seq += 1;
        let seq = self.change_seq;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.updated_at = Utc::now();
            task.change_seq = seq;
        }
    }

    /// Apply `f` when the task is in `from`. Returns whether it was applied.
    fn transition(
        &mut self,
        id: TaskId,
        from: TaskStateCode,
        f: impl FnOnce(&mut StoredTask),
    ) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.state == from => {
                f(task);
                self.touch(id);
                true
            }
            _ => false,
        }
    }

    fn insert(&mut self, row: TaskRow<'_>) -> TaskId {
        self.next_task_id += 1;
        let id = self.next_task_id;
        self.tasks.insert(
            id,
            StoredTask {
                id,
                session_id: row.session_id,
                parent_id: row.parent_id,
                full_name: row.full_name.to_string(),
                task_type: row.task_type,
                state: row.state,
                flags: row.flags,
                config: row.config.clone(),
                upstreams: row.upstreams,
                state_params: Document::new(),
                carry_params: Document::new(),
                report: None,
                error: None,
                retry_at: None,
                updated_at: Utc::now(),
                change_seq: 0,
            },
        );
        self.touch(id);
        id
    }

    fn children(&self, parent_id: TaskId) -> impl Iterator<Item = &StoredTask> {
        self.tasks
            .values()
            .filter(move |t| t.parent_id == Some(parent_id) && !t.flags.superseded)
    }

    fn upstreams_succeeded(&self, task: &StoredTask) -> bool {
        task.upstreams.iter().all(|up| {
            self.tasks
                .get(up)
                .is_some_and(|u| u.state.can_run_downstream())
        })
    }
}

struct TaskRow<'a> {
    session_id: SessionId,
    parent_id: Option<TaskId>,
    full_name: &'a str,
    task_type: TaskType,
    state: TaskStateCode,
    flags: TaskStateFlags,
    config: &'a Document,
    upstreams: Vec<TaskId>,
}

fn summary(task: &StoredTask) -> TaskStateSummary {
    TaskStateSummary {
        id: task.id,
        parent_id: task.parent_id,
        session_id: task.session_id,
        state: task.state,
        change_seq: task.change_seq,
    }
}

fn retry_at(interval: Option<u32>) -> Option<DateTime<Utc>> {
    interval.map(|secs| Utc::now() + Duration::seconds(i64::from(secs)))
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    tables: Mutex<SessionTables>,
    locks: TaskLocks,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: &NewSession) -> Result<StoredSession, RepositoryError> {
        let mut t = self.tables.lock().await;
        if let Some(time) = session.session_time {
            let duplicate = t.sessions.values().any(|s| {
                s.workflow_name == session.workflow_name && s.session_time == Some(time)
            });
            if duplicate {
                return Err(RepositoryError::Conflict(format!(
                    "session of '{}' at {time} already exists",
                    session.workflow_name
                )));
            }
        }
        t.next_session_id += 1;
        let stored = StoredSession {
            id: t.next_session_id,
            uuid: Uuid::now_v7(),
            site_id: session.site_id,
            workflow_name: session.workflow_name.clone(),
            session_time: session.session_time,
            params: session.params.clone(),
            options: session.options.clone(),
            created_at: Utc::now(),
        };
        t.sessions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<StoredSession>, RepositoryError> {
        Ok(self.tables.lock().await.sessions.get(&id).cloned())
    }

    async fn find_session_by_time(
        &self,
        workflow_name: &str,
        session_time: DateTime<Utc>,
    ) -> Result<Option<StoredSession>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.sessions
            .values()
            .find(|s| s.workflow_name == workflow_name && s.session_time == Some(session_time))
            .cloned())
    }

    async fn list_sessions(&self, limit: u32) -> Result<Vec<StoredSession>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.sessions.values().rev().take(limit as usize).cloned().collect())
    }

    async fn get_root_task(&self, session_id: SessionId) -> Result<Option<StoredTask>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.tasks
            .values()
            .find(|task| task.session_id == session_id && task.parent_id.is_none())
            .cloned())
    }

    async fn list_session_tasks(&self, session_id: SessionId) -> Result<Vec<StoredTask>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.tasks
            .values()
            .filter(|task| task.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn has_any_not_done_root(&self) -> Result<bool, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.tasks
            .values()
            .any(|task| task.parent_id.is_none() && !task.state.is_done()))
    }

    async fn add_task(&self, task: &NewTask) -> Result<TaskId, RepositoryError> {
        let mut t = self.tables.lock().await;
        if !t.sessions.contains_key(&task.session_id) {
            return Err(RepositoryError::NotFound);
        }
        let row = TaskRow {
            session_id: task.session_id,
            parent_id: task.parent_id,
            full_name: &task.full_name,
            task_type: task.task_type,
            state: task.state,
            flags: task.flags,
            config: &task.config,
            upstreams: Vec::new(),
        };
        Ok(t.insert(row))
    }

    async fn add_task_tree(&self, session_id: SessionId, tasks: &[NewTreeTask]) -> Result<Vec<TaskId>, RepositoryError> {
        let mut t = self.tables.lock().await;
        if !t.sessions.contains_key(&session_id) {
            return Err(RepositoryError::NotFound);
        }
        // Validate every reference before the first insert so a bad tree
        // leaves nothing behind.
        for (position, task) in tasks.iter().enumerate() {
            for r in std::iter::once(&task.parent).chain(&task.upstreams) {
                let valid = match *r {
                    TaskRef::Stored(id) => t.tasks.contains_key(&id),
                    TaskRef::Pending(i) => i < position,
                };
                if !valid {
                    return Err(RepositoryError::NotFound);
                }
            }
        }

        let mut assigned: Vec<TaskId> = Vec::with_capacity(tasks.len());
        for task in tasks {
            let row = TaskRow {
                session_id,
                parent_id: task.parent.resolve(&assigned),
                full_name: &task.full_name,
                task_type: task.task_type,
                state: task.state,
                flags: task.flags,
                config: &task.config,
                upstreams: task.upstreams.iter().filter_map(|u| u.resolve(&assigned)).collect(),
            };
            let id = t.insert(row);
            assigned.push(id);
        }
        Ok(assigned)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<StoredTask>, RepositoryError> {
        Ok(self.tables.lock().await.tasks.get(&id).cloned())
    }

    async fn lock_task(&self, id: TaskId) -> Result<Option<TaskLock<'_>>, RepositoryError> {
        let guard = self.locks.acquire(id).await;
        let task = self.tables.lock().await.tasks.get(&id).cloned();
        Ok(task.map(|task| TaskLock::new(task, guard)))
    }

    async fn set_state(&self, id: TaskId, from: TaskStateCode, to: TaskStateCode) -> Result<bool, RepositoryError> {
        let mut t = self.tables.lock().await;
        Ok(t.transition(id, from, |task| task.state = to))
    }

    async fn set_state_with_success_details(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.lock().await;
        Ok(t.transition(id, from, |task| {
            task.state = to;
            task.state_params = state_params.clone();
            task.carry_params = carry_params.clone();
            task.report = Some(report.clone());
            task.error = None;
            task.retry_at = None;
        }))
    }

    async fn set_state_with_error_details(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        retry_interval: Option<u32>,
        error: &Document,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.lock().await;
        Ok(t.transition(id, from, |task| {
            task.state = to;
            task.state_params = state_params.clone();
            task.error = Some(error.clone());
            task.retry_at = retry_at(retry_interval);
        }))
    }

    async fn set_state_with_state_params_update(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        retry_interval: Option<u32>,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.lock().await;
        Ok(t.transition(id, from, |task| {
            task.state = to;
            task.state_params = state_params.clone();
            task.retry_at = retry_at(retry_interval);
        }))
    }

    async fn set_flags(&self, id: TaskId, state: TaskStateCode, flags: TaskStateFlags) -> Result<bool, RepositoryError> {
        let mut t = self.tables.lock().await;
        Ok(t.transition(id, state, |task| task.flags = flags))
    }

    async fn is_all_children_done(&self, parent_id: TaskId) -> Result<bool, RepositoryError> {
        let t = self.tables.lock().await;
        let progressible = t.children(parent_id).any(|child| {
            child.state.is_progressing()
                || (child.state == TaskStateCode::Blocked && t.upstreams_succeeded(child))
        });
        Ok(!progressible)
    }

    async fn collect_children_errors(&self, parent_id: TaskId) -> Result<Vec<Document>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.children(parent_id)
            .filter(|child| child.state.is_error())
            .map(|child| {
                child
                    .error
                    .clone()
                    .unwrap_or_else(|| error_document(format!("{} failed", child.full_name)))
            })
            .collect())
    }

    async fn try_set_children_blocked_to_ready_or_short_circuit_planned(
        &self,
        parent_id: TaskId,
    ) -> Result<u64, RepositoryError> {
        let mut t = self.tables.lock().await;
        let parent_ok = t
            .tasks
            .get(&parent_id)
            .is_some_and(|p| p.state.can_run_children());
        if !parent_ok {
            return Ok(0);
        }
        let promotions: Vec<(TaskId, TaskStateCode)> = t
            .children(parent_id)
            .filter(|child| child.state == TaskStateCode::Blocked && t.upstreams_succeeded(child))
            .map(|child| {
                let next = if child.flags.cancel_requested {
                    TaskStateCode::Canceled
                } else if child.is_grouping_only() {
                    TaskStateCode::Planned
                } else {
                    TaskStateCode::Ready
                };
                (child.id, next)
            })
            .collect();
        let mut count = 0;
        for (id, next) in promotions {
            if t.transition(id, TaskStateCode::Blocked, |task| task.state = next) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_superseded(&self, ids: &[TaskId]) -> Result<(), RepositoryError> {
        let mut t = self.tables.lock().await;
        for id in ids {
            if let Some(task) = t.tasks.get_mut(id) {
                task.flags.superseded = true;
                t.touch(*id);
            }
        }
        Ok(())
    }

    async fn request_cancel_session(&self, session_id: SessionId) -> Result<u64, RepositoryError> {
        let mut t = self.tables.lock().await;
        let ids: Vec<TaskId> = t
            .tasks
            .values()
            .filter(|task| {
                task.session_id == session_id && !task.state.is_done() && !task.flags.cancel_requested
            })
            .map(|task| task.id)
            .collect();
        for id in &ids {
            if let Some(task) = t.tasks.get_mut(id) {
                task.flags.cancel_requested = true;
            }
            t.touch(*id);
        }
        Ok(ids.len() as u64)
    }

    async fn find_tasks_by_state(
        &self,
        state: TaskStateCode,
        last_id: TaskId,
        limit: u32,
    ) -> Result<Vec<TaskStateSummary>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.tasks
            .range(last_id + 1..)
            .map(|(_, task)| task)
            .filter(|task| task.state == state)
            .take(limit as usize)
            .map(summary)
            .collect())
    }

    async fn find_all_ready_task_ids(&self, limit: u32) -> Result<Vec<TaskId>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.tasks
            .values()
            .filter(|task| task.state == TaskStateCode::Ready)
            .take(limit as usize)
            .map(|task| task.id)
            .collect())
    }

    async fn find_recently_changed_tasks(
        &self,
        since_seq: i64,
        limit: u32,
    ) -> Result<Vec<TaskStateSummary>, RepositoryError> {
        let t = self.tables.lock().await;
        let mut changed: Vec<TaskStateSummary> = t
            .tasks
            .values()
            .filter(|task| task.change_seq > since_seq)
            .map(summary)
            .collect();
        changed.sort_by_key(|s| s.change_seq);
        changed.truncate(limit as usize);
        Ok(changed)
    }

    async fn try_set_retry_waiting_to_ready(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut t = self.tables.lock().await;
        let due: Vec<(TaskId, TaskStateCode, bool)> = t
            .tasks
            .values()
            .filter(|task| {
                matches!(
                    task.state,
                    TaskStateCode::RetryWaiting | TaskStateCode::GroupRetryWaiting
                ) && task.retry_at.is_none_or(|at| at <= now)
            })
            .map(|task| (task.id, task.state, task.flags.cancel_requested))
            .collect();
        let mut count = 0;
        for (id, from, canceled) in due {
            let to = if canceled {
                TaskStateCode::Canceled
            } else {
                TaskStateCode::Ready
            };
            if t.transition(id, from, |task| {
                task.state = to;
                task.retry_at = None;
            }) {
                count += 1;
            }
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScheduleTables {
    next_id: ScheduleId,
    rows: BTreeMap<ScheduleId, StoredSchedule>,
}

/// In-memory [`ScheduleStore`].
#[derive(Default)]
pub struct InMemoryScheduleStore {
    tables: Mutex<ScheduleTables>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    async fn upsert_schedule(&self, schedule: &NewSchedule) -> Result<StoredSchedule, RepositoryError> {
        let mut t = self.tables.lock().await;
        let existing = t
            .rows
            .values()
            .find(|s| s.workflow_name == schedule.workflow_name && s.kind == schedule.kind)
            .map(|s| (s.id, s.last_session_time));
        let (id, last_session_time) = match existing {
            Some(found) => found,
            None => {
                t.next_id += 1;
                (t.next_id, None)
            }
        };
        let stored = StoredSchedule {
            id,
            workflow_name: schedule.workflow_name.clone(),
            kind: schedule.kind,
            config: schedule.config.clone(),
            timezone: schedule.timezone.clone(),
            next_run_time: schedule.next.run_time(),
            next_schedule_time: schedule.next.schedule_time(),
            last_session_time,
        };
        t.rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_schedule(
        &self,
        workflow_name: &str,
        kind: ScheduleKind,
    ) -> Result<Option<StoredSchedule>, RepositoryError> {
        let t = self.tables.lock().await;
        Ok(t.rows
            .values()
            .find(|s| s.workflow_name == workflow_name && s.kind == kind)
            .cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<StoredSchedule>, RepositoryError> {
        Ok(self.tables.lock().await.rows.values().cloned().collect())
    }

    async fn delete_schedules(&self, workflow_name: &str) -> Result<u64, RepositoryError> {
        let mut t = self.tables.lock().await;
        let before = t.rows.len();
        t.rows.retain(|_, s| s.workflow_name != workflow_name);
        Ok((before - t.rows.len()) as u64)
    }

    async fn find_due_schedules(
        &self,
        kind: ScheduleKind,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let t = self.tables.lock().await;
        let mut due: Vec<StoredSchedule> = t
            .rows
            .values()
            .filter(|s| s.kind == kind && s.next_run_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run_time, s.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn update_next_schedule_time(
        &self,
        id: ScheduleId,
        expected_run_time: DateTime<Utc>,
        update: &ScheduleUpdate,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.lock().await;
        match t.rows.get_mut(&id) {
            Some(row) if row.next_run_time == expected_run_time => {
                row.next_run_time = update.next.run_time();
                row.next_schedule_time = update.next.schedule_time();
                if update.last_session_time.is_some() {
                    row.last_session_time = update.last_session_time;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
