//! Shared domain types for taskflow.
//!
//! This crate contains the data model used across the engine: the ordered
//! configuration `Document`, compiled workflow tasks, task/session/schedule
//! rows, task state codes and the error types shared by every layer.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod document;
pub mod error;
pub mod schedule;
pub mod session;
pub mod task;
pub mod workflow;
