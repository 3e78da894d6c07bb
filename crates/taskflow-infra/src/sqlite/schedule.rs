//! SQLite schedule repository implementation.

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskflow_core::repository::schedule::{ScheduleStore, ScheduleUpdate};
use taskflow_types::error::RepositoryError;
use taskflow_types::schedule::{NewSchedule, ScheduleId, ScheduleKind, StoredSchedule};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, query_err, to_json};

/// SQLite-backed implementation of `ScheduleStore`.
pub struct SqliteScheduleStore {
    pool: DatabasePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ScheduleRow {
    id: i64,
    workflow_name: String,
    kind: String,
    config: String,
    timezone: String,
    next_run_time: String,
    next_schedule_time: String,
    last_session_time: Option<String>,
}

impl ScheduleRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            kind: row.try_get("kind")?,
            config: row.try_get("config")?,
            timezone: row.try_get("timezone")?,
            next_run_time: row.try_get("next_run_time")?,
            next_schedule_time: row.try_get("next_schedule_time")?,
            last_session_time: row.try_get("last_session_time")?,
        })
    }

    fn into_schedule(self) -> Result<StoredSchedule, RepositoryError> {
        let kind = ScheduleKind::parse(&self.kind)
            .ok_or_else(|| RepositoryError::Query(format!("invalid schedule kind: {}", self.kind)))?;
        Ok(StoredSchedule {
            id: self.id,
            workflow_name: self.workflow_name,
            kind,
            config: parse_json(&self.config, "schedule config")?,
            timezone: self.timezone,
            next_run_time: parse_datetime(&self.next_run_time)?,
            next_schedule_time: parse_datetime(&self.next_schedule_time)?,
            last_session_time: self.last_session_time.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn schedules_from_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<StoredSchedule>, RepositoryError> {
    rows.iter()
        .map(|row| ScheduleRow::from_row(row).map_err(query_err)?.into_schedule())
        .collect()
}

impl ScheduleStore for SqliteScheduleStore {
    async fn upsert_schedule(&self, schedule: &NewSchedule) -> Result<StoredSchedule, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO schedules
               (workflow_name, kind, config, timezone, next_run_time, next_schedule_time, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_name, kind) DO UPDATE SET
                 config = excluded.config,
                 timezone = excluded.timezone,
                 next_run_time = excluded.next_run_time,
                 next_schedule_time = excluded.next_schedule_time,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&schedule.workflow_name)
        .bind(schedule.kind.as_str())
        .bind(to_json(&schedule.config)?)
        .bind(&schedule.timezone)
        .bind(format_datetime(&schedule.next.run_time()))
        .bind(format_datetime(&schedule.next.schedule_time()))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        // read back through the writer so the row is visible immediately
        let row = sqlx::query("SELECT * FROM schedules WHERE workflow_name = ? AND kind = ?")
            .bind(&schedule.workflow_name)
            .bind(schedule.kind.as_str())
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_err)?;
        ScheduleRow::from_row(&row).map_err(query_err)?.into_schedule()
    }

    async fn get_schedule(
        &self,
        workflow_name: &str,
        kind: ScheduleKind,
    ) -> Result<Option<StoredSchedule>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE workflow_name = ? AND kind = ?")
            .bind(workflow_name)
            .bind(kind.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|row| ScheduleRow::from_row(&row).map_err(query_err)?.into_schedule())
            .transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY workflow_name ASC, kind ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        schedules_from_rows(&rows)
    }

    async fn delete_schedules(&self, workflow_name: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE workflow_name = ?")
            .bind(workflow_name)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn find_due_schedules(
        &self,
        kind: ScheduleKind,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE kind = ? AND next_run_time <= ? ORDER BY next_run_time ASC, id ASC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        schedules_from_rows(&rows)
    }

    async fn update_next_schedule_time(
        &self,
        id: ScheduleId,
        expected_run_time: DateTime<Utc>,
        update: &ScheduleUpdate,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE schedules SET
                 next_run_time = ?,
                 next_schedule_time = ?,
                 last_session_time = COALESCE(?, last_session_time),
                 updated_at = ?
               WHERE id = ? AND next_run_time = ?"#,
        )
        .bind(format_datetime(&update.next.run_time()))
        .bind(format_datetime(&update.next.schedule_time()))
        .bind(update.last_session_time.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(id)
        .bind(format_datetime(&expected_run_time))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_types::document::Document;
    use taskflow_types::schedule::ScheduleTime;

    async fn test_store() -> (tempfile::TempDir, SqliteScheduleStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let store = SqliteScheduleStore::new(DatabasePool::new(&url).await.unwrap());
        (dir, store)
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn schedule(kind: ScheduleKind, run: &str, sched: &str) -> NewSchedule {
        NewSchedule {
            workflow_name: "etl".to_string(),
            kind,
            config: Document::from_value(json!({"schedule": {"daily>": "07:00:00"}})).unwrap(),
            timezone: "UTC".to_string(),
            next: ScheduleTime::new(at(run), at(sched)).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_times_and_keeps_id() {
        let (_dir, store) = test_store().await;
        let first = store
            .upsert_schedule(&schedule(ScheduleKind::Workflow, "2024-01-01T07:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let second = store
            .upsert_schedule(&schedule(ScheduleKind::Workflow, "2024-01-02T07:00:00Z", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.next_run_time, at("2024-01-02T07:00:00Z"));
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_rows_filtered_by_kind_and_time() {
        let (_dir, store) = test_store().await;
        store
            .upsert_schedule(&schedule(ScheduleKind::Workflow, "2024-01-01T07:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_schedule(&schedule(ScheduleKind::Sla, "2024-01-01T09:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let now = at("2024-01-01T10:00:00Z");
        let due = store.find_due_schedules(ScheduleKind::Workflow, now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, ScheduleKind::Workflow);
        assert!(store
            .find_due_schedules(ScheduleKind::Sla, at("2024-01-01T08:59:59Z"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_conditional_write_back() {
        let (_dir, store) = test_store().await;
        let row = store
            .upsert_schedule(&schedule(ScheduleKind::Workflow, "2024-01-01T07:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let update = ScheduleUpdate {
            next: ScheduleTime::new(at("2024-01-02T07:00:00Z"), at("2024-01-02T00:00:00Z")).unwrap(),
            last_session_time: Some(at("2024-01-01T00:00:00Z")),
        };
        assert!(store.update_next_schedule_time(row.id, row.next_run_time, &update).await.unwrap());
        // a second driver holding the stale run time loses
        assert!(!store.update_next_schedule_time(row.id, row.next_run_time, &update).await.unwrap());

        let stored = store.get_schedule("etl", ScheduleKind::Workflow).await.unwrap().unwrap();
        assert_eq!(stored.next_schedule_time, at("2024-01-02T00:00:00Z"));
        assert_eq!(stored.last_session_time, Some(at("2024-01-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_lock_ready_schedules_advances_each_row_once() {
        let (_dir, store) = test_store().await;
        store
            .upsert_schedule(&schedule(ScheduleKind::Workflow, "2024-01-01T07:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let now = at("2024-01-01T07:00:00Z");
        let advance = |row: StoredSchedule| async move {
            ScheduleUpdate {
                next: ScheduleTime::new(
                    row.next_run_time + chrono::Duration::days(1),
                    row.next_schedule_time + chrono::Duration::days(1),
                )
                .unwrap(),
                last_session_time: Some(row.next_schedule_time),
            }
        };
        let advanced = store
            .lock_ready_schedules(ScheduleKind::Workflow, now, 10, advance)
            .await
            .unwrap();
        assert_eq!(advanced, 1);
        let again = store
            .lock_ready_schedules(ScheduleKind::Workflow, now, 10, advance)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_delete_schedules_removes_all_kinds() {
        let (_dir, store) = test_store().await;
        store
            .upsert_schedule(&schedule(ScheduleKind::Workflow, "2024-01-01T07:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_schedule(&schedule(ScheduleKind::Sla, "2024-01-01T09:00:00Z", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(store.delete_schedules("etl").await.unwrap(), 2);
        assert!(store.get_schedule("etl", ScheduleKind::Sla).await.unwrap().is_none());
    }
}
