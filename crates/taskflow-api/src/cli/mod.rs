//! CLI command definitions for the `tflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands that only read a
//! workflow file (`check`, `run --in-memory`) never open the database.

pub mod check;
pub mod run;
pub mod schedule;
pub mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use taskflow_types::task::TaskStateCode;

/// Compile, run and schedule task workflows.
#[derive(Parser)]
#[command(name = "tflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans as OpenTelemetry traces on stdout.
    #[arg(long, global = true, env = "TASKFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a workflow file and show its task tree.
    Check {
        /// Path to the workflow file.
        file: PathBuf,
    },

    /// Submit a workflow and run it to completion.
    Run {
        /// Path to the workflow file.
        file: PathBuf,

        /// Session parameter as key=value (repeatable).
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Logical session time (RFC 3339). Exposed as `session_time`.
        #[arg(long)]
        session_time: Option<String>,

        /// Keep all state in memory instead of the database.
        #[arg(long)]
        in_memory: bool,
    },

    /// List recent sessions.
    Sessions {
        /// Maximum number of sessions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the tasks of a session.
    Tasks {
        /// Session id.
        session_id: i64,
    },

    /// Request cancellation of a session's unfinished tasks.
    Cancel {
        /// Session id.
        session_id: i64,
    },

    /// Manage workflow schedules.
    Schedule {
        #[command(subcommand)]
        action: schedule::ScheduleCommand,
    },
}

/// Colored cell for a task state.
pub fn state_cell(state: TaskStateCode) -> Cell {
    let color = match state {
        TaskStateCode::Success => Color::Green,
        TaskStateCode::Error | TaskStateCode::GroupError => Color::Red,
        TaskStateCode::Canceled => Color::DarkGrey,
        TaskStateCode::RetryWaiting | TaskStateCode::GroupRetryWaiting => Color::Yellow,
        TaskStateCode::Running | TaskStateCode::Planned => Color::Cyan,
        TaskStateCode::Blocked | TaskStateCode::Ready => Color::White,
    };
    Cell::new(state.as_str()).fg(color)
}
