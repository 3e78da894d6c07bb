//! SQLite connection pools for the session and schedule stores.
//!
//! Task transitions are short write transactions, so all writes go through a
//! single-connection writer pool and never contend for the SQLite write lock
//! inside the process. Reads (state scans, change feed, session queries) use
//! a separate read-only pool. Both run in WAL mode so readers never block the
//! writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Read connections kept open for concurrent scans.
const READER_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Split read/write pool for SQLite with WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `database_url` and apply
    /// pending migrations. The parent directory of a file database is
    /// created as well.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);
        ensure_parent_dir(base_opts.get_filename()).await?;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        // The reader pool is read-only, so the schema must exist first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(database_url, "database ready");
        Ok(Self { reader, writer })
    }

    /// Close both pools, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

async fn ensure_parent_dir(filename: &Path) -> Result<(), sqlx::Error> {
    // `:memory:` and bare file names have no directory to create.
    match filename.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await.map_err(sqlx::Error::Io)
        }
        _ => Ok(()),
    }
}

/// Data directory from `TASKFLOW_DATA_DIR`, falling back to `~/.taskflow`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("TASKFLOW_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskflow"),
    }
}

/// Database URL used when `taskflow.toml` names none: `{data_dir}/taskflow.db`.
pub fn default_database_url() -> String {
    format!("sqlite://{}", default_data_dir().join("taskflow.db").display())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(dir: &Path, name: &str) -> String {
        format!("sqlite://{}", dir.join(name).display())
    }

    #[tokio::test]
    async fn test_migrations_create_engine_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&url(dir.path(), "flows.db")).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            names,
            ["change_sequence", "schedules", "sessions", "task_dependencies", "tasks"]
        );
    }

    #[tokio::test]
    async fn test_change_sequence_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&url(dir.path(), "flows.db")).await.unwrap();

        let (value,): (i64,) = sqlx::query_as("SELECT value FROM change_sequence WHERE id = 1")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let url = url(dir.path(), "flows.db");
        DatabasePool::new(&url).await.unwrap().close().await;

        let pool = DatabasePool::new(&url).await.unwrap();
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let (fk,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn test_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        DatabasePool::new(&url(&nested, "flows.db")).await.unwrap();
        assert!(nested.join("flows.db").exists());
    }

    #[test]
    fn test_default_database_url() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("taskflow.db"));
    }
}
