//! `tflow check`: compile a workflow file without running it.

use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::Utc;
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;
use taskflow_core::schedule::SchedulerManager;
use taskflow_core::schedule::sla::SlaCalculator;
use taskflow_core::workflow::compiler::WorkflowCompiler;
use taskflow_types::schedule::ScheduleTime;
use taskflow_types::workflow::{Workflow, WorkflowDefinition};

use crate::definition::load_workflow_file;

pub async fn check_workflow(file: &Path, json: bool) -> Result<()> {
    let definition = load_workflow_file(file).await?;
    let workflow = WorkflowCompiler::compile(&definition.name, &definition.config)
        .map_err(|e| anyhow!("Workflow '{}' is invalid: {e}", definition.name))?;
    let next = first_trigger(&definition)?;

    if json {
        let out = serde_json::json!({
            "name": workflow.name,
            "timezone": definition.timezone,
            "tasks": workflow.tasks,
            "next_run_time": next.map(|t| t.run_time()),
            "next_schedule_time": next.map(|t| t.schedule_time()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' compiled: {} tasks",
        style("✓").green().bold(),
        style(&workflow.name).cyan(),
        workflow.tasks.len()
    );
    println!();
    println!("{}", task_table(&workflow));
    if let Some(next) = next {
        println!();
        println!(
            "  Next run at {} (session time {}, {})",
            style(next.run_time().to_rfc3339()).bold(),
            next.schedule_time().to_rfc3339(),
            definition.timezone
        );
    }
    println!();
    Ok(())
}

/// First trigger of the workflow's schedule, after validating its SLA.
fn first_trigger(definition: &WorkflowDefinition) -> Result<Option<ScheduleTime>> {
    let schedule = definition.config.get_nested_or_empty("schedule")?;
    if schedule.is_empty() {
        return Ok(None);
    }
    let scheduler = SchedulerManager::with_builtins().get_scheduler(&schedule, &definition.timezone)?;
    let sla = definition.config.get_nested_or_empty("sla")?;
    if !sla.is_empty() {
        SlaCalculator::parse(&sla)?;
    }
    Ok(Some(scheduler.first_schedule_time(Utc::now())?))
}

fn task_table(workflow: &Workflow) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Task", "Type", "Upstreams"]);

    for task in &workflow.tasks {
        let upstreams = task
            .upstream_indexes
            .iter()
            .filter_map(|&i| workflow.tasks.get(i))
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(task.task_index),
            Cell::new(&task.full_name),
            Cell::new(task.task_type.as_str()),
            Cell::new(upstreams),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_workflow_yaml;

    #[test]
    fn test_first_trigger_without_schedule() {
        let def = parse_workflow_yaml("wf", "+a:\n  echo>: hi\n").unwrap();
        assert!(first_trigger(&def).unwrap().is_none());
    }

    #[test]
    fn test_first_trigger_daily() {
        let def = parse_workflow_yaml(
            "wf",
            "schedule:\n  daily>: \"07:00:00\"\n+a:\n  echo>: hi\n",
        )
        .unwrap();
        let next = first_trigger(&def).unwrap().unwrap();
        assert!(next.run_time() > Utc::now() - chrono::Duration::days(1));
    }

    #[test]
    fn test_first_trigger_rejects_unknown_scheduler() {
        let def = parse_workflow_yaml("wf", "schedule:\n  weekly>: mon\n+a:\n  echo>: hi\n").unwrap();
        assert!(first_trigger(&def).is_err());
    }

    #[test]
    fn test_task_table_lists_every_task() {
        let def = parse_workflow_yaml("wf", "+a:\n  echo>: a\n+b:\n  echo>: b\n").unwrap();
        let workflow = WorkflowCompiler::compile(&def.name, &def.config).unwrap();
        let rendered = task_table(&workflow).to_string();
        assert!(rendered.contains("+wf+a"));
        assert!(rendered.contains("+wf+b"));
    }
}
