//! Infrastructure layer for taskflow.
//!
//! Contains implementations of the store traits defined in `taskflow-core`
//! (SQLite with WAL and split reader/writer pools), the host operators such
//! as `sh>`, and the `taskflow.toml` configuration loader.

pub mod config;
pub mod operator;
pub mod sqlite;
