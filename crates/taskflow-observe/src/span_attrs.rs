//! Span and attribute names shared by the binaries.
//!
//! Attribute names are usable with `Span::record`; the span must declare the
//! field (e.g. `session_id = tracing::field::Empty`) for the record to stick.

// --- Span names ---

/// One `tflow run` invocation.
pub const SPAN_RUN: &str = "tflow.run";

/// The long-running schedule and SLA drivers of `tflow schedule serve`.
pub const SPAN_SCHEDULER: &str = "tflow.scheduler";

// --- Attributes ---

/// Name of the workflow being run or scheduled.
pub const WORKFLOW_NAME: &str = "workflow.name";

/// Id of the session started by the command.
pub const SESSION_ID: &str = "session.id";

/// Final root task state of the session.
pub const SESSION_STATE: &str = "session.state";

/// Number of failed tasks reported for the session.
pub const SESSION_FAILED_TASKS: &str = "session.failed_tasks";
