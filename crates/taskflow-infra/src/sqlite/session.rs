//! SQLite session and task repository implementation.
//!
//! Implements `SessionStore` from `taskflow-core`. Every task mutation runs in
//! its own writer transaction that takes the next value of the store-wide
//! change counter and applies a conditional `UPDATE ... WHERE state = ?`. A
//! transaction whose update matched no row is rolled back, so the counter
//! only advances on real changes.

use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use taskflow_core::repository::lock::{TaskLock, TaskLocks};
use taskflow_core::repository::session::SessionStore;
use taskflow_types::document::Document;
use taskflow_types::error::RepositoryError;
use taskflow_types::session::{NewSession, StoredSession};
use taskflow_types::task::{
    NewTask, NewTreeTask, SessionId, StoredTask, TaskId, TaskReport, TaskStateCode,
    TaskStateFlags, TaskStateSummary, TaskType, error_document,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, query_err, to_json};

/// SQLite-backed implementation of `SessionStore`.
pub struct SqliteSessionStore {
    pool: DatabasePool,
    locks: TaskLocks,
}

impl SqliteSessionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            locks: TaskLocks::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, session_id, parent_id, full_name, task_type, state, state_flags, config, \
     state_params, carry_params, report, error, retry_at, updated_at, change_seq";

const SUMMARY_COLUMNS: &str = "id, parent_id, session_id, state, change_seq";

struct SessionRow {
    id: i64,
    uuid: String,
    site_id: i32,
    workflow_name: String,
    session_time: Option<String>,
    params: String,
    options: String,
    created_at: String,
}

impl SessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            uuid: row.try_get("uuid")?,
            site_id: row.try_get("site_id")?,
            workflow_name: row.try_get("workflow_name")?,
            session_time: row.try_get("session_time")?,
            params: row.try_get("params")?,
            options: row.try_get("options")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_session(self) -> Result<StoredSession, RepositoryError> {
        Ok(StoredSession {
            id: self.id,
            uuid: self
                .uuid
                .parse::<Uuid>()
                .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
            site_id: self.site_id,
            workflow_name: self.workflow_name,
            session_time: self.session_time.as_deref().map(parse_datetime).transpose()?,
            params: parse_json(&self.params, "session params")?,
            options: parse_json(&self.options, "session options")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct TaskRow {
    id: i64,
    session_id: i64,
    parent_id: Option<i64>,
    full_name: String,
    task_type: String,
    state: i16,
    state_flags: i32,
    config: String,
    state_params: String,
    carry_params: String,
    report: Option<String>,
    error: Option<String>,
    retry_at: Option<String>,
    updated_at: String,
    change_seq: i64,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            parent_id: row.try_get("parent_id")?,
            full_name: row.try_get("full_name")?,
            task_type: row.try_get("task_type")?,
            state: row.try_get("state")?,
            state_flags: row.try_get("state_flags")?,
            config: row.try_get("config")?,
            state_params: row.try_get("state_params")?,
            carry_params: row.try_get("carry_params")?,
            report: row.try_get("report")?,
            error: row.try_get("error")?,
            retry_at: row.try_get("retry_at")?,
            updated_at: row.try_get("updated_at")?,
            change_seq: row.try_get("change_seq")?,
        })
    }

    fn into_task(self, upstreams: Vec<TaskId>) -> Result<StoredTask, RepositoryError> {
        Ok(StoredTask {
            id: self.id,
            session_id: self.session_id,
            parent_id: self.parent_id,
            full_name: self.full_name,
            task_type: parse_task_type(&self.task_type)?,
            state: parse_state(self.state)?,
            flags: TaskStateFlags::from_bits(self.state_flags),
            config: parse_json(&self.config, "task config")?,
            upstreams,
            state_params: parse_json(&self.state_params, "state params")?,
            carry_params: parse_json(&self.carry_params, "carry params")?,
            report: self.report.as_deref().map(|s| parse_json(s, "report")).transpose()?,
            error: self.error.as_deref().map(|s| parse_json(s, "error")).transpose()?,
            retry_at: self.retry_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
            change_seq: self.change_seq,
        })
    }
}

fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskStateSummary, RepositoryError> {
    let state: i16 = row.try_get("state").map_err(query_err)?;
    Ok(TaskStateSummary {
        id: row.try_get("id").map_err(query_err)?,
        parent_id: row.try_get("parent_id").map_err(query_err)?,
        session_id: row.try_get("session_id").map_err(query_err)?,
        state: parse_state(state)?,
        change_seq: row.try_get("change_seq").map_err(query_err)?,
    })
}

fn parse_state(code: i16) -> Result<TaskStateCode, RepositoryError> {
    TaskStateCode::from_code(code).ok_or_else(|| RepositoryError::Query(format!("invalid task state: {code}")))
}

fn parse_task_type(s: &str) -> Result<TaskType, RepositoryError> {
    match s {
        "action" => Ok(TaskType::Action),
        "grouping_only" => Ok(TaskType::GroupingOnly),
        other => Err(RepositoryError::Query(format!("invalid task type: {other}"))),
    }
}

/// Comma-separated state codes for `IN (...)` clauses.
fn code_list(states: impl IntoIterator<Item = TaskStateCode>) -> String {
    states
        .into_iter()
        .map(|s| s.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn superseded_bit() -> i32 {
    TaskStateFlags {
        superseded: true,
        ..TaskStateFlags::default()
    }
    .bits()
}

/// Filter on `c` matching BLOCKED tasks whose upstreams all succeeded.
fn blocked_and_runnable() -> String {
    format!(
        "c.state = {blocked} AND NOT EXISTS (\
           SELECT 1 FROM task_dependencies d JOIN tasks u ON u.id = d.upstream_id \
           WHERE d.downstream_id = c.id AND u.state != {success})",
        blocked = TaskStateCode::Blocked.code(),
        success = TaskStateCode::Success.code(),
    )
}

// ---------------------------------------------------------------------------
// Conditional updates
// ---------------------------------------------------------------------------

/// Columns written by one conditional transition.
#[derive(Default)]
struct TaskUpdate<'a> {
    state: Option<TaskStateCode>,
    flags: Option<TaskStateFlags>,
    state_params: Option<&'a Document>,
    carry_params: Option<&'a Document>,
    report: Option<&'a TaskReport>,
    /// `Some(None)` clears the column.
    error: Option<Option<&'a Document>>,
    retry_at: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate<'_> {
    fn to_state(to: TaskStateCode) -> Self {
        Self {
            state: Some(to),
            ..Self::default()
        }
    }

    fn build(&self, id: TaskId, from: TaskStateCode, seq: i64) -> Result<QueryBuilder<'static, Sqlite>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET change_seq = ");
        qb.push_bind(seq);
        qb.push(", updated_at = ").push_bind(format_datetime(&Utc::now()));
        if let Some(state) = self.state {
            qb.push(", state = ").push_bind(state.code());
        }
        if let Some(flags) = self.flags {
            qb.push(", state_flags = ").push_bind(flags.bits());
        }
        if let Some(params) = self.state_params {
            qb.push(", state_params = ").push_bind(to_json(params)?);
        }
        if let Some(params) = self.carry_params {
            qb.push(", carry_params = ").push_bind(to_json(params)?);
        }
        if let Some(report) = self.report {
            qb.push(", report = ").push_bind(to_json(report)?);
        }
        if let Some(error) = self.error {
            qb.push(", error = ").push_bind(error.map(to_json).transpose()?);
        }
        if let Some(retry_at) = self.retry_at {
            qb.push(", retry_at = ").push_bind(retry_at.as_ref().map(format_datetime));
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" AND state = ").push_bind(from.code());
        Ok(qb)
    }
}

fn insert_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        other => query_err(other),
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_task(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: SessionId,
    parent_id: Option<TaskId>,
    full_name: &str,
    task_type: TaskType,
    state: TaskStateCode,
    flags: TaskStateFlags,
    config: &Document,
) -> Result<TaskId, RepositoryError> {
    let seq = next_change_seq(tx).await?;
    let result = sqlx::query(
        r#"INSERT INTO tasks (session_id, parent_id, full_name, task_type, state, state_flags, config, updated_at, change_seq)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(session_id)
    .bind(parent_id)
    .bind(full_name)
    .bind(task_type.as_str())
    .bind(state.code())
    .bind(flags.bits())
    .bind(to_json(config)?)
    .bind(format_datetime(&Utc::now()))
    .bind(seq)
    .execute(&mut **tx)
    .await
    .map_err(insert_err)?;
    Ok(result.last_insert_rowid())
}

async fn next_change_seq(tx: &mut Transaction<'_, Sqlite>) -> Result<i64, RepositoryError> {
    let (seq,): (i64,) = sqlx::query_as("UPDATE change_sequence SET value = value + 1 WHERE id = 1 RETURNING value")
        .fetch_one(&mut **tx)
        .await
        .map_err(query_err)?;
    Ok(seq)
}

fn retry_at(interval: Option<u32>) -> Option<DateTime<Utc>> {
    interval.map(|secs| Utc::now() + Duration::seconds(i64::from(secs)))
}

impl SqliteSessionStore {
    /// Apply `update` when task `id` is in state `from`.
    async fn transition(&self, id: TaskId, from: TaskStateCode, update: TaskUpdate<'_>) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let seq = next_change_seq(&mut tx).await?;
        let mut query = update.build(id, from, seq)?;
        let result = query.build().execute(&mut *tx).await.map_err(query_err)?;
        if result.rows_affected() == 0 {
            // dropping the transaction rolls the counter back
            return Ok(false);
        }
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn upstreams_of(&self, ids: &[TaskId]) -> Result<Vec<(TaskId, TaskId)>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT downstream_id, upstream_id FROM task_dependencies WHERE downstream_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        qb.push(") ORDER BY downstream_id, upstream_id");
        let rows: Vec<(i64, i64)> = qb
            .build_query_as()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(rows)
    }

    async fn tasks_from_rows(&self, rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<StoredTask>, RepositoryError> {
        let parsed = rows
            .iter()
            .map(TaskRow::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        let ids: Vec<TaskId> = parsed.iter().map(|r| r.id).collect();
        let deps = self.upstreams_of(&ids).await?;
        parsed
            .into_iter()
            .map(|row| {
                let upstreams = deps
                    .iter()
                    .filter(|(down, _)| *down == row.id)
                    .map(|(_, up)| *up)
                    .collect();
                row.into_task(upstreams)
            })
            .collect()
    }

    async fn task_ids(&self, sql: &str, bind: i64) -> Result<Vec<TaskId>, RepositoryError> {
        let rows: Vec<(i64,)> = sqlx::query_as(sql)
            .bind(bind)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// ---------------------------------------------------------------------------
// SessionStore impl
// ---------------------------------------------------------------------------

impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: &NewSession) -> Result<StoredSession, RepositoryError> {
        let uuid = Uuid::now_v7();
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO sessions (uuid, site_id, workflow_name, session_time, params, options, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(uuid.to_string())
        .bind(session.site_id)
        .bind(&session.workflow_name)
        .bind(session.session_time.as_ref().map(format_datetime))
        .bind(to_json(&session.params)?)
        .bind(to_json(&session.options)?)
        .bind(format_datetime(&created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(format!(
                "session of '{}' at {} already exists",
                session.workflow_name,
                session.session_time.map(|t| t.to_rfc3339()).unwrap_or_default()
            )),
            other => query_err(other),
        })?;

        Ok(StoredSession {
            id: result.last_insert_rowid(),
            uuid,
            site_id: session.site_id,
            workflow_name: session.workflow_name.clone(),
            session_time: session.session_time,
            params: session.params.clone(),
            options: session.options.clone(),
            created_at,
        })
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<StoredSession>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|row| SessionRow::from_row(&row).map_err(query_err)?.into_session())
            .transpose()
    }

    async fn find_session_by_time(
        &self,
        workflow_name: &str,
        session_time: DateTime<Utc>,
    ) -> Result<Option<StoredSession>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE workflow_name = ? AND session_time = ?")
            .bind(workflow_name)
            .bind(format_datetime(&session_time))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|row| SessionRow::from_row(&row).map_err(query_err)?.into_session())
            .transpose()
    }

    async fn list_sessions(&self, limit: u32) -> Result<Vec<StoredSession>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            sessions.push(SessionRow::from_row(row).map_err(query_err)?.into_session()?);
        }
        Ok(sessions)
    }

    async fn get_root_task(&self, session_id: SessionId) -> Result<Option<StoredTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE session_id = ? AND parent_id IS NULL ORDER BY id LIMIT 1"
        ))
        .bind(session_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(self.tasks_from_rows(&rows).await?.into_iter().next())
    }

    async fn list_session_tasks(&self, session_id: SessionId) -> Result<Vec<StoredTask>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE session_id = ? ORDER BY id"))
            .bind(session_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        self.tasks_from_rows(&rows).await
    }

    async fn has_any_not_done_root(&self) -> Result<bool, RepositoryError> {
        let done = code_list(TaskStateCode::ALL.into_iter().filter(|s| s.is_done()));
        let (exists,): (bool,) = sqlx::query_as(&format!(
            "SELECT EXISTS (SELECT 1 FROM tasks WHERE parent_id IS NULL AND state NOT IN ({done}))"
        ))
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(exists)
    }

    async fn add_task(&self, task: &NewTask) -> Result<TaskId, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let id = insert_task(
            &mut tx,
            task.session_id,
            task.parent_id,
            &task.full_name,
            task.task_type,
            task.state,
            task.flags,
            &task.config,
        )
        .await?;
        tx.commit().await.map_err(query_err)?;
        Ok(id)
    }

    async fn add_task_tree(&self, session_id: SessionId, tasks: &[NewTreeTask]) -> Result<Vec<TaskId>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut assigned: Vec<TaskId> = Vec::with_capacity(tasks.len());
        for task in tasks {
            // A dangling reference drops the transaction, rolling back the tree.
            let parent = task.parent.resolve(&assigned).ok_or(RepositoryError::NotFound)?;
            let id = insert_task(
                &mut tx,
                session_id,
                Some(parent),
                &task.full_name,
                task.task_type,
                task.state,
                task.flags,
                &task.config,
            )
            .await?;
            for upstream in &task.upstreams {
                let upstream = upstream.resolve(&assigned).ok_or(RepositoryError::NotFound)?;
                sqlx::query("INSERT OR IGNORE INTO task_dependencies (downstream_id, upstream_id) VALUES (?, ?)")
                    .bind(id)
                    .bind(upstream)
                    .execute(&mut *tx)
                    .await
                    .map_err(insert_err)?;
            }
            assigned.push(id);
        }
        tx.commit().await.map_err(query_err)?;
        Ok(assigned)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<StoredTask>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(self.tasks_from_rows(&rows).await?.into_iter().next())
    }

    async fn lock_task(&self, id: TaskId) -> Result<Option<TaskLock<'_>>, RepositoryError> {
        let guard = self.locks.acquire(id).await;
        let task = self.get_task(id).await?;
        Ok(task.map(|task| TaskLock::new(task, guard)))
    }

    async fn set_state(&self, id: TaskId, from: TaskStateCode, to: TaskStateCode) -> Result<bool, RepositoryError> {
        self.transition(id, from, TaskUpdate::to_state(to)).await
    }

    async fn set_state_with_success_details(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        carry_params: &Document,
        report: &TaskReport,
    ) -> Result<bool, RepositoryError> {
        let update = TaskUpdate {
            state_params: Some(state_params),
            carry_params: Some(carry_params),
            report: Some(report),
            error: Some(None),
            retry_at: Some(None),
            ..TaskUpdate::to_state(to)
        };
        self.transition(id, from, update).await
    }

    async fn set_state_with_error_details(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        retry_interval: Option<u32>,
        error: &Document,
    ) -> Result<bool, RepositoryError> {
        let update = TaskUpdate {
            state_params: Some(state_params),
            error: Some(Some(error)),
            retry_at: Some(retry_at(retry_interval)),
            ..TaskUpdate::to_state(to)
        };
        self.transition(id, from, update).await
    }

    async fn set_state_with_state_params_update(
        &self,
        id: TaskId,
        from: TaskStateCode,
        to: TaskStateCode,
        state_params: &Document,
        retry_interval: Option<u32>,
    ) -> Result<bool, RepositoryError> {
        let update = TaskUpdate {
            state_params: Some(state_params),
            retry_at: Some(retry_at(retry_interval)),
            ..TaskUpdate::to_state(to)
        };
        self.transition(id, from, update).await
    }

    async fn set_flags(&self, id: TaskId, state: TaskStateCode, flags: TaskStateFlags) -> Result<bool, RepositoryError> {
        let update = TaskUpdate {
            flags: Some(flags),
            ..TaskUpdate::default()
        };
        self.transition(id, state, update).await
    }

    async fn is_all_children_done(&self, parent_id: TaskId) -> Result<bool, RepositoryError> {
        let progressing = code_list(TaskStateCode::ALL.into_iter().filter(|s| s.is_progressing()));
        let (any,): (bool,) = sqlx::query_as(&format!(
            "SELECT EXISTS (SELECT 1 FROM tasks c WHERE c.parent_id = ? AND (c.state_flags & ?) = 0 \
             AND (c.state IN ({progressing}) OR ({runnable})))",
            runnable = blocked_and_runnable(),
        ))
        .bind(parent_id)
        .bind(superseded_bit())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(!any)
    }

    async fn collect_children_errors(&self, parent_id: TaskId) -> Result<Vec<Document>, RepositoryError> {
        let errors = code_list([TaskStateCode::Error, TaskStateCode::GroupError]);
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&format!(
            "SELECT full_name, error FROM tasks WHERE parent_id = ? AND (state_flags & ?) = 0 \
             AND state IN ({errors}) ORDER BY id"
        ))
        .bind(parent_id)
        .bind(superseded_bit())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        rows.into_iter()
            .map(|(full_name, error)| match error {
                Some(error) => parse_json(&error, "error"),
                None => Ok(error_document(format!("{full_name} failed"))),
            })
            .collect()
    }

    async fn try_set_children_blocked_to_ready_or_short_circuit_planned(
        &self,
        parent_id: TaskId,
    ) -> Result<u64, RepositoryError> {
        let parent_ok = self
            .get_task(parent_id)
            .await?
            .is_some_and(|p| p.state.can_run_children());
        if !parent_ok {
            return Ok(0);
        }
        let rows: Vec<(i64, String, i32)> = sqlx::query_as(&format!(
            "SELECT c.id, c.task_type, c.state_flags FROM tasks c WHERE c.parent_id = ? \
             AND (c.state_flags & ?) = 0 AND {runnable} ORDER BY c.id",
            runnable = blocked_and_runnable(),
        ))
        .bind(parent_id)
        .bind(superseded_bit())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut count = 0;
        for (id, task_type, bits) in rows {
            let next = if TaskStateFlags::from_bits(bits).cancel_requested {
                TaskStateCode::Canceled
            } else if parse_task_type(&task_type)?.is_grouping_only() {
                TaskStateCode::Planned
            } else {
                TaskStateCode::Ready
            };
            if self.set_state(id, TaskStateCode::Blocked, next).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_superseded(&self, ids: &[TaskId]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        for id in ids {
            let seq = next_change_seq(&mut tx).await?;
            sqlx::query("UPDATE tasks SET state_flags = state_flags | ?, change_seq = ?, updated_at = ? WHERE id = ?")
                .bind(superseded_bit())
                .bind(seq)
                .bind(format_datetime(&Utc::now()))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn request_cancel_session(&self, session_id: SessionId) -> Result<u64, RepositoryError> {
        let done = code_list(TaskStateCode::ALL.into_iter().filter(|s| s.is_done()));
        let cancel = TaskStateFlags {
            cancel_requested: true,
            ..TaskStateFlags::default()
        }
        .bits();
        let ids = self
            .task_ids(
                &format!(
                    "SELECT id FROM tasks WHERE session_id = ? AND state NOT IN ({done}) \
                     AND (state_flags & {cancel}) = 0 ORDER BY id"
                ),
                session_id,
            )
            .await?;

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut count = 0;
        for id in ids {
            let seq = next_change_seq(&mut tx).await?;
            let result = sqlx::query(&format!(
                "UPDATE tasks SET state_flags = state_flags | {cancel}, change_seq = ?, updated_at = ? \
                 WHERE id = ? AND state NOT IN ({done})"
            ))
            .bind(seq)
            .bind(format_datetime(&Utc::now()))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
            count += result.rows_affected();
        }
        tx.commit().await.map_err(query_err)?;
        Ok(count)
    }

    async fn find_tasks_by_state(
        &self,
        state: TaskStateCode,
        last_id: TaskId,
        limit: u32,
    ) -> Result<Vec<TaskStateSummary>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM tasks WHERE state = ? AND id > ? ORDER BY id LIMIT ?"
        ))
        .bind(state.code())
        .bind(last_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn find_all_ready_task_ids(&self, limit: u32) -> Result<Vec<TaskId>, RepositoryError> {
        self.task_ids(
            &format!(
                "SELECT id FROM tasks WHERE state = {} ORDER BY id LIMIT ?",
                TaskStateCode::Ready.code()
            ),
            i64::from(limit),
        )
        .await
    }

    async fn find_recently_changed_tasks(
        &self,
        since_seq: i64,
        limit: u32,
    ) -> Result<Vec<TaskStateSummary>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM tasks WHERE change_seq > ? ORDER BY change_seq LIMIT ?"
        ))
        .bind(since_seq)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn try_set_retry_waiting_to_ready(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let waiting = code_list([TaskStateCode::RetryWaiting, TaskStateCode::GroupRetryWaiting]);
        let rows: Vec<(i64, i16, i32)> = sqlx::query_as(&format!(
            "SELECT id, state, state_flags FROM tasks WHERE state IN ({waiting}) \
             AND (retry_at IS NULL OR retry_at <= ?) ORDER BY id"
        ))
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut count = 0;
        for (id, state, bits) in rows {
            let to = if TaskStateFlags::from_bits(bits).cancel_requested {
                TaskStateCode::Canceled
            } else {
                TaskStateCode::Ready
            };
            let update = TaskUpdate {
                retry_at: Some(None),
                ..TaskUpdate::to_state(to)
            };
            if self.transition(id, parse_state(state)?, update).await? {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_types::task::TaskRef;

    async fn test_store() -> (tempfile::TempDir, SqliteSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let store = SqliteSessionStore::new(DatabasePool::new(&url).await.unwrap());
        (dir, store)
    }

    fn new_task(session_id: SessionId, parent_id: Option<TaskId>, name: &str, task_type: TaskType) -> NewTask {
        NewTask {
            session_id,
            parent_id,
            full_name: name.to_string(),
            task_type,
            state: if parent_id.is_none() { TaskStateCode::Planned } else { TaskStateCode::Blocked },
            flags: TaskStateFlags::initial(),
            config: Document::new().with("echo>", name),
        }
    }

    fn tree_task(parent: TaskRef, upstreams: &[TaskRef], name: &str) -> NewTreeTask {
        NewTreeTask {
            parent,
            upstreams: upstreams.to_vec(),
            full_name: name.to_string(),
            task_type: TaskType::Action,
            state: TaskStateCode::Blocked,
            flags: TaskStateFlags::default(),
            config: Document::new().with("echo>", name),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (_dir, store) = test_store().await;
        let time = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let created = store
            .create_session(&NewSession::new(0, "wf").with_session_time(time))
            .await
            .unwrap();
        let loaded = store.get_session(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_name, "wf");
        assert_eq!(loaded.session_time, Some(time));
        assert_eq!(loaded.params.get_str("session_time").unwrap(), "2024-01-01T00:00:00+00:00");

        let found = store.find_session_by_time("wf", time).await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_session_time_conflicts() {
        let (_dir, store) = test_store().await;
        let time = Utc::now();
        store.create_session(&NewSession::new(0, "wf").with_session_time(time)).await.unwrap();
        let err = store
            .create_session(&NewSession::new(0, "wf").with_session_time(time))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // unscheduled sessions never collide
        store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        assert_eq!(store.list_sessions(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_conditional_update_only_once() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::Action)).await.unwrap();
        store.set_state(root, TaskStateCode::Planned, TaskStateCode::Ready).await.unwrap();

        assert!(store.set_state(root, TaskStateCode::Ready, TaskStateCode::Running).await.unwrap());
        assert!(!store.set_state(root, TaskStateCode::Ready, TaskStateCode::Planned).await.unwrap());
        assert_eq!(store.get_task(root).await.unwrap().unwrap().state, TaskStateCode::Running);
    }

    #[tokio::test]
    async fn test_change_seq_only_advances_on_change() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::GroupingOnly)).await.unwrap();
        let before = store.get_task(root).await.unwrap().unwrap().change_seq;

        assert!(!store.set_state(root, TaskStateCode::Ready, TaskStateCode::Running).await.unwrap());
        assert!(store.find_recently_changed_tasks(before, 10).await.unwrap().is_empty());

        store.set_state(root, TaskStateCode::Planned, TaskStateCode::Success).await.unwrap();
        let changed = store.find_recently_changed_tasks(before, 10).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].change_seq, before + 1);
        assert_eq!(changed[0].state, TaskStateCode::Success);
    }

    #[tokio::test]
    async fn test_children_promotion_and_done_check() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::GroupingOnly)).await.unwrap();
        let ids = store
            .add_task_tree(
                s.id,
                &[
                    tree_task(TaskRef::Stored(root), &[], "+wf+a"),
                    tree_task(TaskRef::Stored(root), &[TaskRef::Pending(0)], "+wf+b"),
                ],
            )
            .await
            .unwrap();
        let (a, b) = (ids[0], ids[1]);

        assert!(!store.is_all_children_done(root).await.unwrap());
        assert_eq!(store.try_set_children_blocked_to_ready_or_short_circuit_planned(root).await.unwrap(), 1);
        assert_eq!(store.find_all_ready_task_ids(10).await.unwrap(), vec![a]);

        store.set_state(a, TaskStateCode::Ready, TaskStateCode::Running).await.unwrap();
        store
            .set_state_with_error_details(
                a,
                TaskStateCode::Running,
                TaskStateCode::Error,
                &Document::new(),
                None,
                &error_document("boom"),
            )
            .await
            .unwrap();
        // +b waits on a failed upstream and can never run
        assert!(store.is_all_children_done(root).await.unwrap());
        let errors = store.collect_children_errors(root).await.unwrap();
        assert_eq!(errors, vec![error_document("boom")]);

        let tasks = store.list_session_tasks(s.id).await.unwrap();
        assert_eq!(tasks.iter().find(|t| t.id == b).unwrap().upstreams, vec![a]);
    }

    #[tokio::test]
    async fn test_task_tree_rolls_back_on_dangling_reference() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::GroupingOnly)).await.unwrap();
        let before = store.get_task(root).await.unwrap().unwrap().change_seq;

        let err = store
            .add_task_tree(
                s.id,
                &[
                    tree_task(TaskRef::Stored(root), &[], "+wf+a"),
                    tree_task(TaskRef::Stored(root), &[TaskRef::Pending(5)], "+wf+b"),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert_eq!(store.list_session_tasks(s.id).await.unwrap().len(), 1);
        assert!(store.find_recently_changed_tasks(before, 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_have_one_winner() {
        let (_dir, store) = test_store().await;
        let store = std::sync::Arc::new(store);
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::Action)).await.unwrap();
        store.set_state(root, TaskStateCode::Planned, TaskStateCode::Ready).await.unwrap();

        let targets = [TaskStateCode::Running, TaskStateCode::Planned, TaskStateCode::Canceled];
        let handles: Vec<_> = (0..12)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                let to = targets[i % targets.len()];
                tokio::spawn(async move { (to, store.set_state(root, TaskStateCode::Ready, to).await.unwrap()) })
            })
            .collect();
        let mut winners = Vec::new();
        for handle in handles {
            let (to, won) = handle.await.unwrap();
            if won {
                winners.push(to);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(store.get_task(root).await.unwrap().unwrap().state, winners[0]);
    }

    #[tokio::test]
    async fn test_superseded_children_are_ignored() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::GroupingOnly)).await.unwrap();
        let a = store.add_task(&new_task(s.id, Some(root), "+wf+a", TaskType::Action)).await.unwrap();
        store.mark_superseded(&[a]).await.unwrap();

        assert!(store.is_all_children_done(root).await.unwrap());
        assert_eq!(store.try_set_children_blocked_to_ready_or_short_circuit_planned(root).await.unwrap(), 0);
        assert!(store.get_task(a).await.unwrap().unwrap().flags.superseded);
    }

    #[tokio::test]
    async fn test_retry_waiting_and_cancel() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::Action)).await.unwrap();
        store.set_state(root, TaskStateCode::Planned, TaskStateCode::Running).await.unwrap();
        store
            .set_state_with_state_params_update(
                root,
                TaskStateCode::Running,
                TaskStateCode::RetryWaiting,
                &Document::new().with("retry_count", 1),
                Some(60),
            )
            .await
            .unwrap();

        assert_eq!(store.try_set_retry_waiting_to_ready(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.request_cancel_session(s.id).await.unwrap(), 1);
        assert_eq!(
            store.try_set_retry_waiting_to_ready(Utc::now() + Duration::seconds(61)).await.unwrap(),
            1
        );
        let task = store.get_task(root).await.unwrap().unwrap();
        assert_eq!(task.state, TaskStateCode::Canceled);
        assert_eq!(task.retry_at, None);
        assert!(!store.has_any_not_done_root().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_task_reads_current_row() {
        let (_dir, store) = test_store().await;
        let s = store.create_session(&NewSession::new(0, "wf")).await.unwrap();
        let root = store.add_task(&new_task(s.id, None, "+wf", TaskType::Action)).await.unwrap();
        let lock = store.lock_task(root).await.unwrap().unwrap();
        assert_eq!(lock.task.full_name, "+wf");
        drop(lock);
        assert!(store.lock_task(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_task_to_missing_session() {
        let (_dir, store) = test_store().await;
        let err = store.add_task(&new_task(42, None, "+wf", TaskType::Action)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
