//! Workflow engine core: compilation, task state machine and session execution.
//!
//! - `compiler` -- nested definition -> flat task list, validation
//! - `task_control` -- compare-and-swap transitions of one task
//! - `retry` -- `_retry` parsing and interval computation
//! - `propagator` -- change-feed cursor for incremental status propagation
//! - `executor` -- session submission and the executor loop
//! - `dispatch` -- dispatcher and result callback boundary, in-process agent
//! - `operator` -- operator trait, registry and built-in operators

pub mod compiler;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod operator;
pub mod propagator;
pub mod retry;
pub mod task_control;
