//! Runtime task model: state codes, flags, stored rows and dispatch actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::Document;

pub type TaskId = i64;
pub type SessionId = i64;

// ---------------------------------------------------------------------------
// TaskStateCode
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// Codes are stable: they are persisted as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStateCode {
    Blocked,
    Ready,
    RetryWaiting,
    GroupRetryWaiting,
    Running,
    Planned,
    GroupError,
    Success,
    Error,
    Canceled,
}

impl TaskStateCode {
    pub const ALL: [TaskStateCode; 10] = [
        TaskStateCode::Blocked,
        TaskStateCode::Ready,
        TaskStateCode::RetryWaiting,
        TaskStateCode::GroupRetryWaiting,
        TaskStateCode::Running,
        TaskStateCode::Planned,
        TaskStateCode::GroupError,
        TaskStateCode::Success,
        TaskStateCode::Error,
        TaskStateCode::Canceled,
    ];

    pub fn code(self) -> i16 {
        match self {
            TaskStateCode::Blocked => 0,
            TaskStateCode::Ready => 1,
            TaskStateCode::RetryWaiting => 2,
            TaskStateCode::GroupRetryWaiting => 3,
            TaskStateCode::Running => 4,
            TaskStateCode::Planned => 5,
            TaskStateCode::GroupError => 6,
            TaskStateCode::Success => 7,
            TaskStateCode::Error => 8,
            TaskStateCode::Canceled => 9,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Terminal states. GROUP_ERROR is terminal: a failed group never
    /// progresses again unless a group retry re-inserts its children.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskStateCode::GroupError
                | TaskStateCode::Success
                | TaskStateCode::Error
                | TaskStateCode::Canceled
        )
    }

    /// States in which a task's BLOCKED children may be promoted.
    pub fn can_run_children(self) -> bool {
        matches!(self, TaskStateCode::Planned | TaskStateCode::Success)
    }

    /// States in which a task satisfies its downstream siblings.
    pub fn can_run_downstream(self) -> bool {
        self == TaskStateCode::Success
    }

    /// States that will progress without any outside event.
    pub fn is_progressing(self) -> bool {
        matches!(
            self,
            TaskStateCode::Ready
                | TaskStateCode::RetryWaiting
                | TaskStateCode::GroupRetryWaiting
                | TaskStateCode::Running
                | TaskStateCode::Planned
        )
    }

    pub fn is_error(self) -> bool {
        matches!(self, TaskStateCode::Error | TaskStateCode::GroupError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStateCode::Blocked => "blocked",
            TaskStateCode::Ready => "ready",
            TaskStateCode::RetryWaiting => "retry_waiting",
            TaskStateCode::GroupRetryWaiting => "group_retry_waiting",
            TaskStateCode::Running => "running",
            TaskStateCode::Planned => "planned",
            TaskStateCode::GroupError => "group_error",
            TaskStateCode::Success => "success",
            TaskStateCode::Error => "error",
            TaskStateCode::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStateCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskType / TaskStateFlags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Action,
    GroupingOnly,
}

impl TaskType {
    pub fn is_grouping_only(self) -> bool {
        self == TaskType::GroupingOnly
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Action => "action",
            TaskType::GroupingOnly => "grouping_only",
        }
    }
}

/// Bookkeeping bits stored next to the state code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateFlags {
    #[serde(default)]
    pub cancel_requested: bool,
    /// The task failed itself and is waiting for its `^error` subtree.
    #[serde(default)]
    pub delayed_error: bool,
    /// Children failed and the `^error` subtree was added.
    #[serde(default)]
    pub delayed_group_error: bool,
    /// Inserted from the compiled workflow (not generated at runtime).
    #[serde(default)]
    pub initial_task: bool,
    /// Replaced by a newer generation during group retry.
    #[serde(default)]
    pub superseded: bool,
}

impl TaskStateFlags {
    const CANCEL_REQUESTED: i32 = 1;
    const DELAYED_ERROR: i32 = 1 << 1;
    const DELAYED_GROUP_ERROR: i32 = 1 << 2;
    const INITIAL_TASK: i32 = 1 << 3;
    const SUPERSEDED: i32 = 1 << 4;

    pub fn initial() -> Self {
        Self {
            initial_task: true,
            ..Self::default()
        }
    }

    pub fn bits(self) -> i32 {
        let mut bits = 0;
        if self.cancel_requested {
            bits |= Self::CANCEL_REQUESTED;
        }
        if self.delayed_error {
            bits |= Self::DELAYED_ERROR;
        }
        if self.delayed_group_error {
            bits |= Self::DELAYED_GROUP_ERROR;
        }
        if self.initial_task {
            bits |= Self::INITIAL_TASK;
        }
        if self.superseded {
            bits |= Self::SUPERSEDED;
        }
        bits
    }

    pub fn from_bits(bits: i32) -> Self {
        Self {
            cancel_requested: bits & Self::CANCEL_REQUESTED != 0,
            delayed_error: bits & Self::DELAYED_ERROR != 0,
            delayed_group_error: bits & Self::DELAYED_GROUP_ERROR != 0,
            initial_task: bits & Self::INITIAL_TASK != 0,
            superseded: bits & Self::SUPERSEDED != 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Task rows
// ---------------------------------------------------------------------------

/// Structured summary written on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    #[serde(default, skip_serializing_if = "Document::is_empty")]
    pub input_params: Document,
    #[serde(default, skip_serializing_if = "Document::is_empty")]
    pub output_params: Document,
}

/// A task about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub session_id: SessionId,
    pub parent_id: Option<TaskId>,
    pub full_name: String,
    pub task_type: TaskType,
    pub state: TaskStateCode,
    pub flags: TaskStateFlags,
    pub config: Document,
}

/// Parent or upstream of a task inserted as part of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRef {
    /// A task already in the store.
    Stored(TaskId),
    /// An earlier entry of the same tree, by position.
    Pending(usize),
}

impl TaskRef {
    /// Resolve against the ids assigned to earlier entries.
    pub fn resolve(self, assigned: &[TaskId]) -> Option<TaskId> {
        match self {
            TaskRef::Stored(id) => Some(id),
            TaskRef::Pending(i) => assigned.get(i).copied(),
        }
    }
}

/// One entry of a task tree inserted together with its dependency edges.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTreeTask {
    pub parent: TaskRef,
    pub upstreams: Vec<TaskRef>,
    pub full_name: String,
    pub task_type: TaskType,
    pub state: TaskStateCode,
    pub flags: TaskStateFlags,
    pub config: Document,
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTask {
    pub id: TaskId,
    pub session_id: SessionId,
    pub parent_id: Option<TaskId>,
    pub full_name: String,
    pub task_type: TaskType,
    pub state: TaskStateCode,
    pub flags: TaskStateFlags,
    pub config: Document,
    /// Upstream task ids this task waits for.
    #[serde(default)]
    pub upstreams: Vec<TaskId>,
    #[serde(default)]
    pub state_params: Document,
    #[serde(default)]
    pub carry_params: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<TaskReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Store-wide monotonically increasing change counter.
    pub change_seq: i64,
}

impl StoredTask {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_grouping_only(&self) -> bool {
        self.task_type.is_grouping_only()
    }
}

/// Lightweight row returned by paged state scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStateSummary {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub session_id: SessionId,
    pub state: TaskStateCode,
    pub change_seq: i64,
}

/// `(full_name, state, error)` of a task, as reported to users.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub full_name: String,
    pub state: TaskStateCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Document>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execution request handed to a task queue dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub task_id: TaskId,
    pub site_id: i32,
    pub full_name: String,
    pub config: Document,
    pub params: Document,
    pub state_params: Document,
}

/// Build the structured error payload stored on failed tasks.
pub fn error_document(message: impl Into<String>) -> Document {
    Document::new().with("message", message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in TaskStateCode::ALL {
            assert_eq!(TaskStateCode::from_code(state.code()), Some(state));
        }
        assert_eq!(TaskStateCode::from_code(42), None);
    }

    #[test]
    fn test_done_family() {
        let done: Vec<TaskStateCode> = TaskStateCode::ALL
            .into_iter()
            .filter(|s| s.is_done())
            .collect();
        assert_eq!(
            done,
            vec![
                TaskStateCode::GroupError,
                TaskStateCode::Success,
                TaskStateCode::Error,
                TaskStateCode::Canceled
            ]
        );
        assert!(!TaskStateCode::Planned.is_done());
        assert!(!TaskStateCode::Blocked.is_done());
    }

    #[test]
    fn test_children_and_downstream_predicates() {
        assert!(TaskStateCode::Planned.can_run_children());
        assert!(TaskStateCode::Success.can_run_children());
        assert!(!TaskStateCode::Running.can_run_children());
        assert!(TaskStateCode::Success.can_run_downstream());
        assert!(!TaskStateCode::Planned.can_run_downstream());
        assert!(!TaskStateCode::Blocked.is_progressing());
    }

    #[test]
    fn test_flags_bits_round_trip() {
        let flags = TaskStateFlags {
            cancel_requested: true,
            delayed_error: false,
            delayed_group_error: true,
            initial_task: true,
            superseded: false,
        };
        assert_eq!(TaskStateFlags::from_bits(flags.bits()), flags);
        assert_eq!(TaskStateFlags::default().bits(), 0);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStateCode::GroupRetryWaiting).unwrap();
        assert_eq!(json, "\"group_retry_waiting\"");
        assert_eq!(TaskStateCode::GroupRetryWaiting.to_string(), "group_retry_waiting");
    }

    #[test]
    fn test_error_document() {
        let err = error_document("boom");
        assert_eq!(err.get_str("message").unwrap(), "boom");
    }

    #[test]
    fn test_task_ref_resolves_pending_entries() {
        let assigned = [10, 11];
        assert_eq!(TaskRef::Stored(3).resolve(&assigned), Some(3));
        assert_eq!(TaskRef::Pending(1).resolve(&assigned), Some(11));
        assert_eq!(TaskRef::Pending(2).resolve(&assigned), None);
    }
}
