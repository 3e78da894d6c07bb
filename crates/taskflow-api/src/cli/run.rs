//! `tflow run`: submit a workflow and drive it until its session is done.
//!
//! Tasks run in-process through a [`LocalAgent`] with the built-in operators
//! plus `sh>`. Ctrl+C requests cancellation of the session and keeps waiting
//! for the running tasks to settle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;
use taskflow_core::repository::memory::InMemorySessionStore;
use taskflow_core::repository::session::SessionStore;
use taskflow_core::workflow::dispatch::LocalAgent;
use taskflow_core::workflow::error::ExecutorError;
use taskflow_core::workflow::executor::SessionExecutor;
use taskflow_infra::config::load_engine_config;
use taskflow_infra::operator::default_registry;
use taskflow_infra::sqlite::pool::default_data_dir;
use taskflow_observe::span_attrs::{SESSION_FAILED_TASKS, SESSION_ID, SESSION_STATE, SPAN_RUN};
use taskflow_types::session::{NewSession, SessionStatus};
use taskflow_types::task::SessionId;
use taskflow_types::workflow::WorkflowDefinition;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, field, info_span, warn};

use crate::definition::{load_workflow_file, parse_params};
use crate::state::AppState;

/// How often the session status is re-read while waiting.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct RunOptions {
    pub params: Vec<String>,
    pub session_time: Option<String>,
    pub in_memory: bool,
}

pub async fn run_workflow(file: &Path, options: RunOptions, json: bool) -> Result<()> {
    let definition = load_workflow_file(file).await?;
    let session = new_session(&definition, &options)?;

    let status = if options.in_memory {
        let config = load_engine_config(&default_data_dir()).await;
        let executor = SessionExecutor::new(Arc::new(InMemorySessionStore::new()), config.executor);
        execute(Arc::new(executor), &definition, session).await?
    } else {
        let state = AppState::init().await?;
        execute(Arc::clone(&state.executor), &definition, session).await?
    };

    print_status(&status, json)?;
    if !status.is_success() {
        bail!(
            "Session {} of '{}' finished with state {}",
            status.session.id,
            definition.name,
            status.root_state
        );
    }
    Ok(())
}

fn new_session(definition: &WorkflowDefinition, options: &RunOptions) -> Result<NewSession> {
    let params = parse_params(&options.params)?;
    let mut session = NewSession::new(0, &definition.name).with_params(params);
    if let Some(time) = &options.session_time {
        let time = DateTime::parse_from_rfc3339(time)
            .with_context(|| format!("Invalid session time '{time}'"))?
            .with_timezone(&Utc);
        session = session.with_session_time(time);
    }
    Ok(session)
}

/// Submit `definition` and run the executor until the new session is done.
pub async fn execute<S: SessionStore + 'static>(
    executor: Arc<SessionExecutor<S>>,
    definition: &WorkflowDefinition,
    session: NewSession,
) -> Result<SessionStatus, ExecutorError> {
    let span = info_span!(
        SPAN_RUN,
        workflow.name = %definition.name,
        session.id = field::Empty,
        session.state = field::Empty,
        session.failed_tasks = field::Empty
    );

    async move {
        let stored = executor.submit_workflow(definition, session).await?;
        Span::current().record(SESSION_ID, stored.id);

        let agent = LocalAgent::new(Arc::clone(&executor), default_registry());
        let shutdown = CancellationToken::new();
        let (driven, status) = tokio::join!(
            executor.run(&agent, shutdown.clone()),
            wait_for_session(executor.as_ref(), stored.id, shutdown),
        );
        driven?;
        let status = status?;

        let span = Span::current();
        span.record(SESSION_STATE, status.root_state.as_str());
        span.record(SESSION_FAILED_TASKS, status.failed_tasks.len());
        Ok(status)
    }
    .instrument(span)
    .await
}

/// Poll until the session is done, then stop the executor loop.
async fn wait_for_session<S: SessionStore>(
    executor: &SessionExecutor<S>,
    session_id: SessionId,
    shutdown: CancellationToken,
) -> Result<SessionStatus, ExecutorError> {
    let _stop = shutdown.drop_guard();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        let status = executor.session_status(session_id).await?;
        if status.done {
            return Ok(status);
        }
        tokio::select! {
            _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
            signal = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    warn!(session_id, "interrupted, canceling session");
                    executor.cancel_session(session_id).await?;
                }
            }
        }
    }
}

fn print_status(status: &SessionStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    let mark = if status.is_success() {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };
    println!();
    println!(
        "  {mark} Session {} of '{}' finished: {}",
        status.session.id,
        style(&status.session.workflow_name).cyan(),
        status.root_state
    );

    if !status.failed_tasks.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Task", "Error"]);
        for task in &status.failed_tasks {
            let message = task
                .error
                .as_ref()
                .and_then(|e| e.get_optional_str("message").ok().flatten())
                .unwrap_or("");
            table.add_row(vec![Cell::new(&task.full_name), Cell::new(message)]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}
