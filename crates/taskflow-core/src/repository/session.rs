//! Session and task store trait definition.
//!
//! Every task mutation is a compare-and-swap on `(id, expected_state)`:
//! a `false` result means another actor already moved the task and is not
//! an error. Implementations must also bump a store-wide `change_seq` on
//! every insert or update so changes can be followed incrementally.

use chrono::{DateTime, Utc};
use taskflow_types::document::Document;
use taskflow_types::error::RepositoryError;
use taskflow_types::session::{NewSession, StoredSession};
use taskflow_types::task::{
    NewTask, NewTreeTask, SessionId, StoredTask, TaskId, TaskReport, TaskStateCode, TaskStateFlags,
    TaskStateSummary,
};

use super::lock::TaskLock;

/// Repository trait for sessions and their task trees.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SessionStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Create a session row. Fails with `Conflict` when a session with the
    /// same `(workflow_name, session_time)` already exists.
    fn create_session(
        &self,
        session: &NewSession,
    ) -> impl std::future::Future<Output = Result<StoredSession, RepositoryError>> + Send;

    fn get_session(
        &self,
        id: SessionId,
    ) -> impl std::future::Future<Output = Result<Option<StoredSession>, RepositoryError>> + Send;

    /// The session of `workflow_name` scheduled at `session_time`.
    fn find_session_by_time(
        &self,
        workflow_name: &str,
        session_time: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<StoredSession>, RepositoryError>> + Send;

    /// Most recent sessions first.
    fn list_sessions(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSession>, RepositoryError>> + Send;

    fn get_root_task(
        &self,
        session_id: SessionId,
    ) -> impl std::future::Future<Output = Result<Option<StoredTask>, RepositoryError>> + Send;

    /// All tasks of a session ordered by id.
    fn list_session_tasks(
        &self,
        session_id: SessionId,
    ) -> impl std::future::Future<Output = Result<Vec<StoredTask>, RepositoryError>> + Send;

    /// `true` while any session's root task is not done.
    fn has_any_not_done_root(
        &self,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Task rows
    // -----------------------------------------------------------------------

    fn add_task(
        &self,
        task: &NewTask,
    ) -> impl std::future::Future<Output = Result<TaskId, RepositoryError>> + Send;

    /// Insert a task tree and its dependency edges in one atomic write, so
    /// no other actor sees an entry before its upstreams are recorded.
    /// A `Pending` reference must point at an earlier entry. Returns the
    /// assigned ids in entry order.
    fn add_task_tree(
        &self,
        session_id: SessionId,
        tasks: &[NewTreeTask],
    ) -> impl std::future::Future<Output = Result<Vec<TaskId>, RepositoryError>> + Send;

    fn get_task(
        &self,
        id: TaskId,
    ) -> impl std::future::Future<Output = Result<Option<StoredTask>, RepositoryError>> + Send;

    /// Take the task's exclusive lock and read it. `None` if the row is gone.
    fn lock_task(
        &self,
        id: TaskId,
    ) -> impl std::future::Future<Output = Result<Option<TaskLock<'_>>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Conditional transitions
    // -----------------------------------------------------------------------

    fn set_state(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Transition and record the success details. Clears any stored error.
    fn set_state_with_success_details(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Transition and record an error. `retry_interval` (seconds) sets `retry_at`.
    fn set_state_with_error_details(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        retry_interval: Option<u32>,
        error: &Document,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Transition and replace the state params. `retry_interval` sets `retry_at`.
    fn set_state_with_state_params_update(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        retry_interval: Option<u32>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Replace the flags while the task is still in `state`.
    fn set_flags(
        &self,
        id: TaskId,
        state: TaskStateCode,
        flags: TaskStateFlags,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// `true` when no current-generation child can still progress. A BLOCKED
    /// child counts as progressible only if all of its upstreams succeeded.
    fn is_all_children_done(
        &self,
        parent_id: TaskId,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Errors of current-generation children in ERROR or GROUP_ERROR,
    /// ordered by task id.
    fn collect_children_errors(
        &self,
        parent_id: TaskId,
    ) -> impl std::future::Future<Output = Result<Vec<Document>, RepositoryError>> + Send;

    /// Promote BLOCKED children whose upstreams all succeeded, provided the
    /// parent is PLANNED or SUCCESS: grouping-only children to PLANNED,
    /// action children to READY, cancel-requested children to CANCELED.
    /// Returns the number of promoted children.
    fn try_set_children_blocked_to_ready_or_short_circuit_planned(
        &self,
        parent_id: TaskId,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Exclude tasks from child checks (previous group-retry generation).
    fn mark_superseded(
        &self,
        ids: &[TaskId],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set `cancel_requested` on every non-done task of a session.
    fn request_cancel_session(
        &self,
        session_id: SessionId,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Scans
    // -----------------------------------------------------------------------

    /// Page of tasks in `state` with `id > last_id`, ordered by id.
    fn find_tasks_by_state(
        &self,
        state: TaskStateCode,
        last_id: TaskId,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<TaskStateSummary>, RepositoryError>> + Send;

    fn find_all_ready_task_ids(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<TaskId>, RepositoryError>> + Send;

    /// Page of tasks with `change_seq > since_seq`, ordered by `change_seq`.
    fn find_recently_changed_tasks(
        &self,
        since_seq: i64,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<TaskStateSummary>, RepositoryError>> + Send;

    /// Move RETRY_WAITING / GROUP_RETRY_WAITING tasks whose `retry_at` has
    /// passed to READY (or CANCELED when cancel was requested).
    fn try_set_retry_waiting_to_ready(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
