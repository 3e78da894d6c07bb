//! Business logic and store trait definitions for taskflow.
//!
//! This crate defines the "ports" (store traits) that the infrastructure
//! layer implements. It depends only on `taskflow-types` -- never on
//! `taskflow-infra` or any database/IO crate.

pub mod repository;
pub mod schedule;
pub mod workflow;
