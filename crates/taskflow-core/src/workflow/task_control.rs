//! Conditional state transitions for one task.
//!
//! A [`TaskControl`] wraps the row read under the task lock. Each transition
//! is one compare-and-swap in the store; the local `state` only moves when
//! the store accepted the write. A `false` result is a lost race, not an
//! error.

use std::collections::{HashMap, HashSet};

use taskflow_types::document::Document;
use taskflow_types::error::RepositoryError;
use taskflow_types::task::{
    NewTreeTask, SessionId, StoredTask, TaskId, TaskRef, TaskReport, TaskStateCode, TaskStateFlags,
};
use taskflow_types::workflow::WorkflowTask;

use crate::repository::session::SessionStore;

pub struct TaskControl<'a, S: SessionStore> {
    store: &'a S,
    task: StoredTask,
    state: TaskStateCode,
}

impl<'a, S: SessionStore> TaskControl<'a, S> {
    pub fn new(store: &'a S, task: StoredTask) -> Self {
        let state = task.state;
        Self { store, task, state }
    }

    pub fn task(&self) -> &StoredTask {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn state(&self) -> TaskStateCode {
        self.state
    }

    async fn transition(&mut self, from: TaskStateCode, to: TaskStateCode) -> Result<bool, RepositoryError> {
        let updated = self.store.set_state(self.id(), from, to).await?;
        self.mirror(updated, to);
        Ok(updated)
    }

    fn mirror(&mut self, updated: bool, to: TaskStateCode) {
        if updated {
            tracing::debug!(task_id = self.task.id, full_name = %self.task.full_name, from = %self.state, to = %to, "task state changed");
            self.state = to;
            self.task.state = to;
        }
    }

    async fn add_flags(&mut self, f: impl FnOnce(&mut TaskStateFlags)) -> Result<bool, RepositoryError> {
        let mut flags = self.task.flags;
        f(&mut flags);
        let updated = self.store.set_flags(self.id(), self.state, flags).await?;
        if updated {
            self.task.flags = flags;
        }
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Task tree insertion
    // -----------------------------------------------------------------------

    /// Insert every compiled task except index 0, which is the already stored
    /// root `root_id`. Inserted tasks are BLOCKED and flagged as initial.
    pub async fn add_initial_tasks_excepting_root(
        store: &S,
        session_id: SessionId,
        root_id: TaskId,
        tasks: &[WorkflowTask],
    ) -> Result<(), RepositoryError> {
        add_tasks(store, session_id, root_id, tasks, &[], true, true).await?;
        Ok(())
    }

    /// Insert a compiled fragment (`^sub`, `^check`, `^error`) as children of
    /// this task. `root_upstreams` become upstreams of the fragment's root.
    /// Returns the id of the fragment's root.
    pub async fn add_generated_subtasks(
        &self,
        tasks: &[WorkflowTask],
        root_upstreams: &[TaskId],
    ) -> Result<Option<TaskId>, RepositoryError> {
        add_tasks(
            self.store,
            self.task.session_id,
            self.task.id,
            tasks,
            root_upstreams,
            false,
            false,
        )
        .await
    }

    /// Group retry: insert a fresh BLOCKED copy of the initial descendants and
    /// mark the whole previous generation superseded. Returns the number of
    /// copied tasks.
    pub async fn copy_initial_tasks_for_retry(&self) -> Result<usize, RepositoryError> {
        let all = self.store.list_session_tasks(self.task.session_id).await?;

        let mut descendants: HashSet<TaskId> = HashSet::new();
        descendants.insert(self.task.id);
        // ids ascend, and a child always has a larger id than its parent
        for t in &all {
            let under_self = t.parent_id.is_some_and(|p| descendants.contains(&p));
            if under_self && !t.flags.superseded {
                descendants.insert(t.id);
            }
        }
        descendants.remove(&self.task.id);

        // Old id to position in the copied tree. The group itself stays.
        let mut positions: HashMap<TaskId, usize> = HashMap::new();
        let tree_ref = |positions: &HashMap<TaskId, usize>, old: TaskId| {
            if old == self.task.id {
                Some(TaskRef::Stored(old))
            } else {
                positions.get(&old).map(|&i| TaskRef::Pending(i))
            }
        };
        let mut tree: Vec<NewTreeTask> = Vec::new();
        for t in all.iter().filter(|t| descendants.contains(&t.id) && t.flags.initial_task) {
            let Some(parent) = t.parent_id.and_then(|p| tree_ref(&positions, p)) else {
                continue;
            };
            positions.insert(t.id, tree.len());
            tree.push(NewTreeTask {
                parent,
                upstreams: t.upstreams.iter().filter_map(|&u| tree_ref(&positions, u)).collect(),
                full_name: t.full_name.clone(),
                task_type: t.task_type,
                state: TaskStateCode::Blocked,
                flags: TaskStateFlags::initial(),
                config: t.config.clone(),
            });
        }
        let copied = self.store.add_task_tree(self.task.session_id, &tree).await?.len();

        let old: Vec<TaskId> = descendants.into_iter().collect();
        self.store.mark_superseded(&old).await?;
        Ok(copied)
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    pub async fn is_all_children_done(&self) -> Result<bool, RepositoryError> {
        self.store.is_all_children_done(self.id()).await
    }

    pub async fn collect_children_errors(&self) -> Result<Vec<Document>, RepositoryError> {
        self.store.collect_children_errors(self.id()).await
    }

    pub async fn try_set_children_blocked_to_ready_or_short_circuit_planned(&self) -> Result<u64, RepositoryError> {
        self.store
            .try_set_children_blocked_to_ready_or_short_circuit_planned(self.id())
            .await
    }

    // -----------------------------------------------------------------------
    // Dispatch path
    // -----------------------------------------------------------------------

    pub async fn set_ready_to_running(&mut self) -> Result<bool, RepositoryError> {
        self.transition(TaskStateCode::Ready, TaskStateCode::Running).await
    }

    /// Group retry: the fresh children were inserted, wait for them again.
    pub async fn set_ready_to_planned(&mut self) -> Result<bool, RepositoryError> {
        self.transition(TaskStateCode::Ready, TaskStateCode::Planned).await
    }

    /// Resume: a task with a stored report short-circuits without running.
    pub async fn set_ready_to_short_circuit_success(&mut self, report: &TaskReport) -> Result<bool, RepositoryError> {
        let updated = self
            .store
            .set_state_with_success_details(
                self.id(),
                TaskStateCode::Ready,
                TaskStateCode::Success,
                &self.task.state_params,
                &report.output_params,
                report,
            )
            .await?;
        self.mirror(updated, TaskStateCode::Success);
        Ok(updated)
    }

    /// Move any not-done task to CANCELED.
    pub async fn set_to_canceled(&mut self) -> Result<bool, RepositoryError> {
        if self.state.is_done() {
            return Ok(false);
        }
        self.transition(self.state, TaskStateCode::Canceled).await
    }

    // -----------------------------------------------------------------------
    // Result callbacks
    // -----------------------------------------------------------------------

    pub async fn set_running_to_planned_successful(
        &mut self,
        state_params: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> Result<bool, RepositoryError> {
        self.running_to_success_state(TaskStateCode::Planned, state_params, carry_params, report)
            .await
    }

    pub async fn set_running_to_short_circuit_success(
        &mut self,
        state_params: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> Result<bool, RepositoryError> {
        self.running_to_success_state(TaskStateCode::Success, state_params, carry_params, report)
            .await
    }

    async fn running_to_success_state(
        &mut self,
        to: TaskStateCode,
        state_params: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> Result<bool, RepositoryError> {
        let updated = self
            .store
            .set_state_with_success_details(self.id(), TaskStateCode::Running, to, state_params, carry_params, report)
            .await?;
        self.mirror(updated, to);
        Ok(updated)
    }

    /// Failure with an `^error` subtree: stay PLANNED until it finishes.
    pub async fn set_running_to_planned_with_delayed_error(
        &mut self,
        state_params: &Document,
        error: &Document,
    ) -> Result<bool, RepositoryError> {
        if !self.add_flags(|f| f.delayed_error = true).await? {
            return Ok(false);
        }
        let updated = self
            .store
            .set_state_with_error_details(
                self.id(),
                TaskStateCode::Running,
                TaskStateCode::Planned,
                state_params,
                None,
                error,
            )
            .await?;
        self.mirror(updated, TaskStateCode::Planned);
        Ok(updated)
    }

    /// Retry after `retry_interval` seconds, with or without an error.
    pub async fn set_running_to_retry_waiting(
        &mut self,
        state_params: &Document,
        retry_interval: u32,
        error: Option<&Document>,
    ) -> Result<bool, RepositoryError> {
        let (id, from, to) = (self.id(), TaskStateCode::Running, TaskStateCode::RetryWaiting);
        let updated = match error {
            Some(error) => {
                self.store
                    .set_state_with_error_details(id, from, to, state_params, Some(retry_interval), error)
                    .await?
            }
            None => {
                self.store
                    .set_state_with_state_params_update(id, from, to, state_params, Some(retry_interval))
                    .await?
            }
        };
        self.mirror(updated, to);
        Ok(updated)
    }

    pub async fn set_running_to_short_circuit_error(
        &mut self,
        state_params: &Document,
        error: &Document,
    ) -> Result<bool, RepositoryError> {
        let updated = self
            .store
            .set_state_with_error_details(
                self.id(),
                TaskStateCode::Running,
                TaskStateCode::Error,
                state_params,
                None,
                error,
            )
            .await?;
        self.mirror(updated, TaskStateCode::Error);
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Done propagation
    // -----------------------------------------------------------------------

    pub async fn set_planned_to_success(&mut self) -> Result<bool, RepositoryError> {
        self.transition(TaskStateCode::Planned, TaskStateCode::Success).await
    }

    /// The task's own error was stored when it went PLANNED.
    pub async fn set_planned_to_error(&mut self) -> Result<bool, RepositoryError> {
        self.transition(TaskStateCode::Planned, TaskStateCode::Error).await
    }

    /// `error` is `None` when the propagated error was already stored.
    pub async fn set_planned_to_group_error(&mut self, error: Option<&Document>) -> Result<bool, RepositoryError> {
        let Some(error) = error else {
            return self.transition(TaskStateCode::Planned, TaskStateCode::GroupError).await;
        };
        let updated = self
            .store
            .set_state_with_error_details(
                self.id(),
                TaskStateCode::Planned,
                TaskStateCode::GroupError,
                &self.task.state_params,
                None,
                error,
            )
            .await?;
        self.mirror(updated, TaskStateCode::GroupError);
        Ok(updated)
    }

    pub async fn set_planned_to_group_retry_waiting(
        &mut self,
        state_params: &Document,
        retry_interval: u32,
    ) -> Result<bool, RepositoryError> {
        let updated = self
            .store
            .set_state_with_state_params_update(
                self.id(),
                TaskStateCode::Planned,
                TaskStateCode::GroupRetryWaiting,
                state_params,
                Some(retry_interval),
            )
            .await?;
        self.mirror(updated, TaskStateCode::GroupRetryWaiting);
        Ok(updated)
    }

    /// Children failed and an `^error` subtree was added: record the pending
    /// group error and re-evaluate once the subtree is done.
    pub async fn set_planned_to_planned_with_delayed_group_error(
        &mut self,
        error: &Document,
    ) -> Result<bool, RepositoryError> {
        if !self.add_flags(|f| f.delayed_group_error = true).await? {
            return Ok(false);
        }
        self.store
            .set_state_with_error_details(
                self.id(),
                TaskStateCode::Planned,
                TaskStateCode::Planned,
                &self.task.state_params,
                None,
                error,
            )
            .await
    }
}

/// Insert compiled tasks under `parent_id` as one tree, so a fragment
/// becomes visible only together with its dependency edges.
///
/// With `first_is_parent`, index 0 is the already stored `parent_id` itself.
/// Returns the id of the first inserted task.
async fn add_tasks<S: SessionStore>(
    store: &S,
    session_id: SessionId,
    parent_id: TaskId,
    tasks: &[WorkflowTask],
    root_upstreams: &[TaskId],
    first_is_parent: bool,
    initial: bool,
) -> Result<Option<TaskId>, RepositoryError> {
    let skip = usize::from(first_is_parent);
    // compiled index -> reference into the inserted tree
    let tree_ref = |index: usize| {
        if first_is_parent && index == 0 {
            Some(TaskRef::Stored(parent_id))
        } else {
            index.checked_sub(skip).map(TaskRef::Pending)
        }
    };

    let mut tree: Vec<NewTreeTask> = Vec::with_capacity(tasks.len());
    for wt in tasks.iter().skip(skip) {
        let parent = wt
            .parent_index
            .and_then(tree_ref)
            .unwrap_or(TaskRef::Stored(parent_id));
        let mut upstreams: Vec<TaskRef> = wt.upstream_indexes.iter().filter_map(|&i| tree_ref(i)).collect();
        if tree.is_empty() {
            upstreams.extend(root_upstreams.iter().map(|&id| TaskRef::Stored(id)));
        }
        tree.push(NewTreeTask {
            parent,
            upstreams,
            full_name: wt.full_name.clone(),
            task_type: wt.task_type,
            state: TaskStateCode::Blocked,
            flags: if initial { TaskStateFlags::initial() } else { TaskStateFlags::default() },
            config: wt.config.clone(),
        });
    }
    if tree.is_empty() {
        return Ok(None);
    }
    let ids = store.add_task_tree(session_id, &tree).await?;
    Ok(ids.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemorySessionStore;
    use crate::workflow::compiler::WorkflowCompiler;
    use serde_json::json;
    use taskflow_types::session::NewSession;
    use taskflow_types::task::{NewTask, TaskType, error_document};

    async fn setup(config: serde_json::Value) -> (InMemorySessionStore, TaskId) {
        let store = InMemorySessionStore::new();
        let session = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let workflow = WorkflowCompiler::compile("wf", &Document::from_value(config).unwrap()).unwrap();
        let root = store
            .add_task(&NewTask {
                session_id: session.id,
                parent_id: None,
                full_name: workflow.tasks[0].full_name.clone(),
                task_type: workflow.tasks[0].task_type,
                state: TaskStateCode::Planned,
                flags: TaskStateFlags::initial(),
                config: workflow.tasks[0].config.clone(),
            })
            .await
            .unwrap();
        TaskControl::add_initial_tasks_excepting_root(&store, session.id, root, &workflow.tasks)
            .await
            .unwrap();
        (store, root)
    }

    async fn control(store: &InMemorySessionStore, id: TaskId) -> TaskControl<'_, InMemorySessionStore> {
        TaskControl::new(store, store.get_task(id).await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn test_initial_tasks_keep_tree_shape() {
        let (store, root) = setup(json!({"+a": {"sh>": "a"}, "+g": {"+x": {"sh>": "x"}}})).await;
        let tasks = store.list_session_tasks(1).await.unwrap();
        assert_eq!(tasks.len(), 4);
        let a = &tasks[1];
        let g = &tasks[2];
        let x = &tasks[3];
        assert_eq!(a.parent_id, Some(root));
        assert_eq!(g.upstreams, vec![a.id]);
        assert_eq!(x.parent_id, Some(g.id));
        assert_eq!(g.task_type, TaskType::GroupingOnly);
        assert!(tasks[1..].iter().all(|t| t.state == TaskStateCode::Blocked && t.flags.initial_task));
    }

    #[tokio::test]
    async fn test_lost_race_keeps_local_state() {
        let (store, _) = setup(json!({"+a": {"sh>": "a"}})).await;
        store.set_state(2, TaskStateCode::Blocked, TaskStateCode::Ready).await.unwrap();

        let mut first = control(&store, 2).await;
        let mut second = control(&store, 2).await;
        assert!(first.set_ready_to_running().await.unwrap());
        assert!(!second.set_ready_to_planned().await.unwrap());
        assert_eq!(first.state(), TaskStateCode::Running);
        assert_eq!(second.state(), TaskStateCode::Ready);
        assert_eq!(store.get_task(2).await.unwrap().unwrap().state, TaskStateCode::Running);
    }

    #[tokio::test]
    async fn test_generated_subtasks_wait_for_root_upstreams() {
        let (store, _) = setup(json!({"+a": {"sh>": "a"}, "+b": {"sh>": "b"}})).await;
        let fragment = WorkflowCompiler::compile_tasks(
            "+wf+a",
            "^check",
            &Document::from_value(json!({"sh>": "check"})).unwrap(),
        )
        .unwrap();
        let a = control(&store, 2).await;
        let check = a.add_generated_subtasks(&fragment, &[3]).await.unwrap().unwrap();
        let stored = store.get_task(check).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, Some(2));
        assert_eq!(stored.upstreams, vec![3]);
        assert_eq!(stored.full_name, "+wf+a^check");
        assert!(!stored.flags.initial_task);
    }

    #[tokio::test]
    async fn test_delayed_error_sets_flag_and_error() {
        let (store, _) = setup(json!({"+a": {"sh>": "a"}})).await;
        store.set_state(2, TaskStateCode::Blocked, TaskStateCode::Running).await.unwrap();
        let mut a = control(&store, 2).await;
        assert!(a
            .set_running_to_planned_with_delayed_error(&Document::new(), &error_document("boom"))
            .await
            .unwrap());
        let stored = store.get_task(2).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskStateCode::Planned);
        assert!(stored.flags.delayed_error);
        assert_eq!(stored.error.unwrap().get_str("message").unwrap(), "boom");
    }

    #[tokio::test]
    async fn test_copy_for_retry_supersedes_previous_generation() {
        let (store, root) = setup(json!({"+a": {"sh>": "a"}, "+b": {"sh>": "b"}})).await;
        store.set_state(2, TaskStateCode::Blocked, TaskStateCode::Success).await.unwrap();
        store.set_state(3, TaskStateCode::Blocked, TaskStateCode::Error).await.unwrap();

        let ctl = control(&store, root).await;
        assert_eq!(ctl.copy_initial_tasks_for_retry().await.unwrap(), 2);

        let tasks = store.list_session_tasks(1).await.unwrap();
        let fresh: Vec<&StoredTask> = tasks.iter().filter(|t| t.id > 3).collect();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[1].upstreams, vec![fresh[0].id]);
        assert!(fresh.iter().all(|t| t.state == TaskStateCode::Blocked && !t.flags.superseded));
        assert!(tasks.iter().filter(|t| t.id == 2 || t.id == 3).all(|t| t.flags.superseded));
        assert!(store.collect_children_errors(root).await.unwrap().is_empty());
    }

    /// Store that runs another executor's child promotion right after every
    /// insert, the moment new rows become visible.
    struct EagerPromotion(InMemorySessionStore);

    impl EagerPromotion {
        async fn promote_everything(&self, session_id: SessionId) -> Result<(), RepositoryError> {
            loop {
                let mut promoted = 0;
                for t in self.0.list_session_tasks(session_id).await? {
                    promoted += self.0.try_set_children_blocked_to_ready_or_short_circuit_planned(t.id).await?;
                }
                if promoted == 0 {
                    return Ok(());
                }
            }
        }
    }

    impl SessionStore for EagerPromotion {
        async fn create_session(&self, s: &NewSession) -> Result<taskflow_types::session::StoredSession, RepositoryError> {
            self.0.create_session(s).await
        }
        async fn get_session(&self, id: SessionId) -> Result<Option<taskflow_types::session::StoredSession>, RepositoryError> {
            self.0.get_session(id).await
        }
        async fn find_session_by_time(
            &self,
            name: &str,
            time: chrono::DateTime<chrono::Utc>,
        ) -> Result<Option<taskflow_types::session::StoredSession>, RepositoryError> {
            self.0.find_session_by_time(name, time).await
        }
        async fn list_sessions(&self, limit: u32) -> Result<Vec<taskflow_types::session::StoredSession>, RepositoryError> {
            self.0.list_sessions(limit).await
        }
        async fn get_root_task(&self, id: SessionId) -> Result<Option<StoredTask>, RepositoryError> {
            self.0.get_root_task(id).await
        }
        async fn list_session_tasks(&self, id: SessionId) -> Result<Vec<StoredTask>, RepositoryError> {
            self.0.list_session_tasks(id).await
        }
        async fn has_any_not_done_root(&self) -> Result<bool, RepositoryError> {
            self.0.has_any_not_done_root().await
        }
        async fn add_task(&self, task: &NewTask) -> Result<TaskId, RepositoryError> {
            let id = self.0.add_task(task).await?;
            self.promote_everything(task.session_id).await?;
            Ok(id)
        }
        async fn add_task_tree(&self, session_id: SessionId, tasks: &[NewTreeTask]) -> Result<Vec<TaskId>, RepositoryError> {
            let ids = self.0.add_task_tree(session_id, tasks).await?;
            self.promote_everything(session_id).await?;
            Ok(ids)
        }
        async fn get_task(&self, id: TaskId) -> Result<Option<StoredTask>, RepositoryError> {
            self.0.get_task(id).await
        }
        async fn lock_task(&self, id: TaskId) -> Result<Option<crate::repository::lock::TaskLock<'_>>, RepositoryError> {
            self.0.lock_task(id).await
        }
        async fn set_state(&self, id: TaskId, from: TaskStateCode, to: TaskStateCode) -> Result<bool, RepositoryError> {
            self.0.set_state(id, from, to).await
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
            self.0.set_state_with_success_details(id, from, to, state_params, carry_params, report).await
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
            self.0.set_state_with_error_details(id, from, to, state_params, retry_interval, error).await
        }
        async fn set_state_with_state_params_update(
            &self,
            id: TaskId,
            from: TaskStateCode,
            to: TaskStateCode,
            state_params: &Document,
            retry_interval: Option<u32>,
        ) -> Result<bool, RepositoryError> {
            self.0.set_state_with_state_params_update(id, from, to, state_params, retry_interval).await
        }
        async fn set_flags(&self, id: TaskId, state: TaskStateCode, flags: TaskStateFlags) -> Result<bool, RepositoryError> {
            self.0.set_flags(id, state, flags).await
        }
        async fn is_all_children_done(&self, id: TaskId) -> Result<bool, RepositoryError> {
            self.0.is_all_children_done(id).await
        }
        async fn collect_children_errors(&self, id: TaskId) -> Result<Vec<Document>, RepositoryError> {
            self.0.collect_children_errors(id).await
        }
        async fn try_set_children_blocked_to_ready_or_short_circuit_planned(&self, id: TaskId) -> Result<u64, RepositoryError> {
            self.0.try_set_children_blocked_to_ready_or_short_circuit_planned(id).await
        }
        async fn mark_superseded(&self, ids: &[TaskId]) -> Result<(), RepositoryError> {
            self.0.mark_superseded(ids).await
        }
        async fn request_cancel_session(&self, id: SessionId) -> Result<u64, RepositoryError> {
            self.0.request_cancel_session(id).await
        }
        async fn find_tasks_by_state(
            &self,
            state: TaskStateCode,
            last_id: TaskId,
            limit: u32,
        ) -> Result<Vec<taskflow_types::task::TaskStateSummary>, RepositoryError> {
            self.0.find_tasks_by_state(state, last_id, limit).await
        }
        async fn find_all_ready_task_ids(&self, limit: u32) -> Result<Vec<TaskId>, RepositoryError> {
            self.0.find_all_ready_task_ids(limit).await
        }
        async fn find_recently_changed_tasks(
            &self,
            since_seq: i64,
            limit: u32,
        ) -> Result<Vec<taskflow_types::task::TaskStateSummary>, RepositoryError> {
            self.0.find_recently_changed_tasks(since_seq, limit).await
        }
        async fn try_set_retry_waiting_to_ready(&self, now: chrono::DateTime<chrono::Utc>) -> Result<u64, RepositoryError> {
            self.0.try_set_retry_waiting_to_ready(now).await
        }
    }

    #[tokio::test]
    async fn test_error_fragment_under_planned_group_keeps_sibling_order() {
        let store = EagerPromotion(InMemorySessionStore::new());
        let session = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let group = store
            .add_task(&NewTask {
                session_id: session.id,
                parent_id: None,
                full_name: "+wf".to_string(),
                task_type: TaskType::GroupingOnly,
                state: TaskStateCode::Planned,
                flags: TaskStateFlags::initial(),
                config: Document::new(),
            })
            .await
            .unwrap();
        let fragment = WorkflowCompiler::compile_tasks(
            "+wf",
            "^error",
            &Document::from_value(json!({"+e1": {"echo>": "1"}, "+e2": {"echo>": "2"}})).unwrap(),
        )
        .unwrap();

        let ctl = TaskControl::new(&store, store.get_task(group).await.unwrap().unwrap());
        ctl.add_generated_subtasks(&fragment, &[]).await.unwrap();

        let tasks = store.list_session_tasks(session.id).await.unwrap();
        let state_of = |name: &str| tasks.iter().find(|t| t.full_name == name).unwrap().state;
        assert_eq!(state_of("+wf^error"), TaskStateCode::Planned);
        assert_eq!(state_of("+wf^error+e1"), TaskStateCode::Ready);
        assert_eq!(state_of("+wf^error+e2"), TaskStateCode::Blocked);
    }
}
