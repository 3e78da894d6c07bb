//! taskflow CLI entry point.
//!
//! Binary name: `tflow`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the command
//! handlers. Commands that need the database build an [`state::AppState`].

mod cli;
mod definition;
mod state;

use clap::Parser;
use taskflow_observe::tracing_setup::{init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG overrides it.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,taskflow_core=debug,taskflow_infra=debug",
        _ => "trace",
    };
    init_tracing(filter, cli.otel).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Check { file } => cli::check::check_workflow(&file, cli.json).await,

        Commands::Run {
            file,
            params,
            session_time,
            in_memory,
        } => {
            let options = cli::run::RunOptions {
                params,
                session_time,
                in_memory,
            };
            cli::run::run_workflow(&file, options, cli.json).await
        }

        Commands::Sessions { limit } => {
            let state = AppState::init().await?;
            cli::session::list_sessions(&state, limit, cli.json).await
        }

        Commands::Tasks { session_id } => {
            let state = AppState::init().await?;
            cli::session::show_tasks(&state, session_id, cli.json).await
        }

        Commands::Cancel { session_id } => {
            let state = AppState::init().await?;
            cli::session::cancel_session(&state, session_id, cli.json).await
        }

        Commands::Schedule { action } => {
            let state = AppState::init().await?;
            cli::schedule::handle_schedule_command(action, &state, cli.json).await
        }
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
