//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (taskflow-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation for tests and dry runs.

pub mod lock;
pub mod memory;
pub mod schedule;
pub mod session;
