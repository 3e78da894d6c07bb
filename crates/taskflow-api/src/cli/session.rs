//! Session inspection commands: `sessions`, `tasks` and `cancel`.

use anyhow::{Result, bail};
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;
use taskflow_core::repository::session::SessionStore;
use taskflow_types::session::StoredSession;
use taskflow_types::task::{SessionId, StoredTask, TaskStateCode};

use super::state_cell;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn list_sessions(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let store = state.executor.store();
    let sessions = store.list_sessions(limit).await?;

    let mut rows = Vec::with_capacity(sessions.len());
    for session in sessions {
        let root_state = store.get_root_task(session.id).await?.map(|t| t.state);
        rows.push((session, root_state));
    }

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(session, state)| {
                serde_json::json!({
                    "session": session,
                    "state": state,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!("  {}", style("No sessions yet.").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Workflow", "Session time", "Created", "State"]);
    for (session, root_state) in &rows {
        table.add_row(session_row(session, *root_state));
    }
    println!("{table}");
    Ok(())
}

fn session_row(session: &StoredSession, root_state: Option<TaskStateCode>) -> Vec<Cell> {
    vec![
        Cell::new(session.id),
        Cell::new(&session.workflow_name),
        Cell::new(
            session
                .session_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        ),
        Cell::new(session.created_at.format("%Y-%m-%d %H:%M:%S")),
        match root_state {
            Some(state) => state_cell(state),
            None => Cell::new("-"),
        },
    ]
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub async fn show_tasks(state: &AppState, session_id: SessionId, json: bool) -> Result<()> {
    let store = state.executor.store();
    if store.get_session(session_id).await?.is_none() {
        bail!("Session {session_id} not found");
    }
    let tasks = store.list_session_tasks(session_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    println!("{}", task_table(&tasks));
    Ok(())
}

fn task_table(tasks: &[StoredTask]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Task", "Type", "State", "Upstreams", "Error"]);

    for task in tasks {
        let name = if task.flags.superseded {
            format!("{} (superseded)", task.full_name)
        } else {
            task.full_name.clone()
        };
        let upstreams = task
            .upstreams
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let error = task
            .error
            .as_ref()
            .and_then(|e| e.get_optional_str("message").ok().flatten())
            .unwrap_or("");
        table.add_row(vec![
            Cell::new(task.id),
            Cell::new(name),
            Cell::new(task.task_type.as_str()),
            state_cell(task.state),
            Cell::new(upstreams),
            Cell::new(error),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn cancel_session(state: &AppState, session_id: SessionId, json: bool) -> Result<()> {
    let count = state.executor.cancel_session(session_id).await?;

    if json {
        let out = serde_json::json!({ "session_id": session_id, "cancel_requested": count });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!(
        "  {} Cancel requested for {} task(s) of session {}",
        style("✓").green().bold(),
        count,
        session_id
    );
    Ok(())
}
