//! `tflow schedule`: register workflow schedules and run the schedule driver.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use clap::Subcommand;
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;
use taskflow_core::repository::schedule::ScheduleStore;
use taskflow_core::repository::session::SessionStore;
use taskflow_core::schedule::executor::ScheduleExecutor;
use taskflow_core::workflow::compiler::WorkflowCompiler;
use taskflow_core::workflow::dispatch::LocalAgent;
use taskflow_infra::operator::default_registry;
use taskflow_observe::span_attrs::SPAN_SCHEDULER;
use taskflow_types::schedule::{ScheduleKind, StoredSchedule};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use crate::definition::load_workflow_file;
use crate::state::{AppState, ConcreteScheduleExecutor};

/// Schedule management subcommands.
#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Register (or refresh) the schedules of workflow files.
    Register {
        /// Workflow files with a `schedule:` section.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Remove every schedule of a workflow.
    Unregister {
        /// Workflow name.
        name: String,
    },

    /// List registered schedules.
    #[command(alias = "ls")]
    List,

    /// Run the executor, schedule and SLA drivers until interrupted.
    Serve {
        /// Workflow files to register before starting.
        files: Vec<PathBuf>,
    },
}

pub async fn handle_schedule_command(cmd: ScheduleCommand, state: &AppState, json: bool) -> Result<()> {
    let scheduler = state.schedule_executor();
    match cmd {
        ScheduleCommand::Register { files } => {
            let registered = register_files(&scheduler, &files).await?;
            print_schedules(&registered, json)
        }
        ScheduleCommand::Unregister { name } => {
            let removed = state.schedules.delete_schedules(&name).await?;
            if json {
                println!("{}", serde_json::json!({ "workflow": name, "removed": removed }));
            } else {
                println!(
                    "  {} Removed {} schedule(s) of '{}'",
                    style("✓").green().bold(),
                    removed,
                    name
                );
            }
            Ok(())
        }
        ScheduleCommand::List => {
            let schedules = state.schedules.list_schedules().await?;
            print_schedules(&schedules, json)
        }
        ScheduleCommand::Serve { files } => {
            register_files(&scheduler, &files).await?;
            serve(state, scheduler).await
        }
    }
}

/// Compile and register each file. Returns the workflow rows written.
async fn register_files<S: SessionStore, R: ScheduleStore>(
    scheduler: &ScheduleExecutor<S, R>,
    files: &[PathBuf],
) -> Result<Vec<StoredSchedule>> {
    let mut registered = Vec::new();
    for file in files {
        let definition = load_workflow_file(file).await?;
        WorkflowCompiler::compile(&definition.name, &definition.config)
            .map_err(|e| anyhow!("Workflow '{}' is invalid: {e}", definition.name))?;
        match scheduler.register_workflow(&definition, Utc::now()).await? {
            Some(row) => registered.push(row),
            None => info!(workflow = %definition.name, "workflow has no schedule"),
        }
    }
    Ok(registered)
}

async fn serve(state: &AppState, scheduler: ConcreteScheduleExecutor) -> Result<()> {
    let sla = state.sla_executor();
    let agent = LocalAgent::new(Arc::clone(&state.executor), default_registry());
    let shutdown = CancellationToken::new();

    println!(
        "  {} Scheduler running on {}",
        style("⚡").bold(),
        style(state.data_dir.display()).cyan()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let span = info_span!(SPAN_SCHEDULER);
    let (driven, (), (), ()) = async {
        tokio::join!(
            state.executor.run(&agent, shutdown.clone()),
            scheduler.run(shutdown.clone()),
            sla.run(shutdown.clone()),
            async {
                crate::shutdown_signal().await;
                info!("shutdown requested");
                shutdown.cancel();
            },
        )
    }
    .instrument(span)
    .await;
    driven?;

    println!("\n  Scheduler stopped.");
    Ok(())
}

fn print_schedules(schedules: &[StoredSchedule], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(schedules)?);
        return Ok(());
    }
    if schedules.is_empty() {
        println!();
        println!("  {}", style("No schedules registered.").dim());
        println!();
        return Ok(());
    }
    println!("{}", schedule_table(schedules));
    Ok(())
}

fn schedule_table(schedules: &[StoredSchedule]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Workflow", "Kind", "Next run", "Schedule time", "Last session", "Timezone"]);

    for schedule in schedules {
        let kind = match schedule.kind {
            ScheduleKind::Workflow => Cell::new(schedule.kind.as_str()),
            ScheduleKind::Sla => Cell::new(schedule.kind.as_str()).fg(comfy_table::Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(&schedule.workflow_name),
            kind,
            Cell::new(schedule.next_run_time.to_rfc3339()),
            Cell::new(schedule.next_schedule_time.to_rfc3339()),
            Cell::new(
                schedule
                    .last_session_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(&schedule.timezone),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_core::repository::memory::{InMemoryScheduleStore, InMemorySessionStore};
    use taskflow_core::schedule::SchedulerManager;
    use taskflow_core::workflow::executor::SessionExecutor;
    use taskflow_types::config::{ExecutorConfig, ScheduleConfig};
    use tempfile::TempDir;

    fn scheduler() -> (
        ScheduleExecutor<InMemorySessionStore, InMemoryScheduleStore>,
        Arc<InMemoryScheduleStore>,
    ) {
        let sessions = Arc::new(SessionExecutor::new(
            Arc::new(InMemorySessionStore::new()),
            ExecutorConfig::default(),
        ));
        let schedules = Arc::new(InMemoryScheduleStore::new());
        let executor = ScheduleExecutor::new(
            sessions,
            Arc::clone(&schedules),
            Arc::new(SchedulerManager::with_builtins()),
            ScheduleConfig::default(),
        );
        (executor, schedules)
    }

    #[tokio::test]
    async fn test_register_files_writes_workflow_and_sla_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.dig");
        tokio::fs::write(
            &path,
            "schedule:\n  daily>: \"07:00:00\"\nsla:\n  duration: \"01:00\"\n+a:\n  echo>: hi\n",
        )
        .await
        .unwrap();

        let (executor, store) = scheduler();
        let rows = register_files(&executor, &[path]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].workflow_name, "report");

        let all = store.list_schedules().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|s| s.kind == ScheduleKind::Sla));
    }

    #[tokio::test]
    async fn test_register_files_skips_unscheduled_workflows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("adhoc.dig");
        tokio::fs::write(&path, "+a:\n  echo>: hi\n").await.unwrap();

        let (executor, store) = scheduler();
        assert!(register_files(&executor, &[path]).await.unwrap().is_empty());
        assert!(store.list_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_files_rejects_invalid_workflow() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.dig");
        tokio::fs::write(
            &path,
            "schedule:\n  daily>: \"07:00:00\"\n+a:\n  echo>: hi\n  sh>: \"true\"\n",
        )
        .await
        .unwrap();

        let (executor, store) = scheduler();
        assert!(register_files(&executor, &[path]).await.is_err());
        assert!(store.list_schedules().await.unwrap().is_empty());
    }
}
