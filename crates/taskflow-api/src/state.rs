//! Application state wiring the engine to its SQLite store.
//!
//! `AppState` pins the generic engine components to the concrete infra
//! implementations and is shared by every command that touches the database.

use std::path::PathBuf;
use std::sync::Arc;

use taskflow_core::schedule::SchedulerManager;
use taskflow_core::schedule::executor::ScheduleExecutor;
use taskflow_core::schedule::sla_executor::SlaExecutor;
use taskflow_core::workflow::executor::SessionExecutor;
use taskflow_infra::config::{load_engine_config, resolve_database_url};
use taskflow_infra::sqlite::pool::{DatabasePool, default_data_dir};
use taskflow_infra::sqlite::schedule::SqliteScheduleStore;
use taskflow_infra::sqlite::session::SqliteSessionStore;
use taskflow_types::config::EngineConfig;

/// Concrete engine types pinned to the SQLite stores.
pub type ConcreteExecutor = SessionExecutor<SqliteSessionStore>;
pub type ConcreteScheduleExecutor = ScheduleExecutor<SqliteSessionStore, SqliteScheduleStore>;
pub type ConcreteSlaExecutor = SlaExecutor<SqliteSessionStore, SqliteScheduleStore>;

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub executor: Arc<ConcreteExecutor>,
    pub schedules: Arc<SqliteScheduleStore>,
    pub schedulers: Arc<SchedulerManager>,
}

impl AppState {
    /// Load `taskflow.toml`, open (and migrate) the database and build the executor.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let database_url = resolve_database_url(&config);
        tracing::debug!(database_url = %database_url, "opening database");
        let pool = DatabasePool::new(&database_url).await?;

        let executor = SessionExecutor::new(
            Arc::new(SqliteSessionStore::new(pool.clone())),
            config.executor.clone(),
        );

        Ok(Self {
            data_dir,
            config,
            executor: Arc::new(executor),
            schedules: Arc::new(SqliteScheduleStore::new(pool)),
            schedulers: Arc::new(SchedulerManager::with_builtins()),
        })
    }

    pub fn schedule_executor(&self) -> ConcreteScheduleExecutor {
        ScheduleExecutor::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.schedules),
            Arc::clone(&self.schedulers),
            self.config.schedule.clone(),
        )
    }

    pub fn sla_executor(&self) -> ConcreteSlaExecutor {
        SlaExecutor::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.schedules),
            Arc::clone(&self.schedulers),
            self.config.schedule.clone(),
        )
    }
}
