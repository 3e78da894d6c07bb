//! Schedule store trait definition.

use chrono::{DateTime, Utc};
use taskflow_types::error::RepositoryError;
use taskflow_types::schedule::{NewSchedule, ScheduleId, ScheduleKind, ScheduleTime, StoredSchedule};

/// New times written back after a schedule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleUpdate {
    pub next: ScheduleTime,
    /// Set when a session was actually started for the fired trigger.
    pub last_session_time: Option<DateTime<Utc>>,
}

/// Repository trait for schedule rows.
///
/// Rows are unique per `(workflow_name, kind)`. Uses native async fn in
/// traits (Rust 2024 edition, no async_trait macro).
pub trait ScheduleStore: Send + Sync {
    /// Insert a schedule or replace the config and times of the existing row.
    fn upsert_schedule(
        &self,
        schedule: &NewSchedule,
    ) -> impl std::future::Future<Output = Result<StoredSchedule, RepositoryError>> + Send;

    fn get_schedule(
        &self,
        workflow_name: &str,
        kind: ScheduleKind,
    ) -> impl std::future::Future<Output = Result<Option<StoredSchedule>, RepositoryError>> + Send;

    fn list_schedules(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSchedule>, RepositoryError>> + Send;

    /// Remove every schedule row of a workflow. Returns the number removed.
    fn delete_schedules(
        &self,
        workflow_name: &str,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Rows of `kind` with `next_run_time <= now`, oldest first.
    fn find_due_schedules(
        &self,
        kind: ScheduleKind,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSchedule>, RepositoryError>> + Send;

    /// Conditional write-back: succeeds only while the row still has
    /// `expected_run_time`, so two drivers never advance the same trigger twice.
    fn update_next_schedule_time(
        &self,
        id: ScheduleId,
        expected_run_time: DateTime<Utc>,
        update: &ScheduleUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Apply `f` to every due schedule of `kind` and write back the times it returns.
    ///
    /// `f` runs without holding a store transaction; the conditional
    /// write-back plus unique `(workflow_name, session_time)` sessions make a
    /// crash between the two steps re-fire the trigger instead of skipping it.
    /// Returns the number of rows advanced.
    fn lock_ready_schedules<F, Fut>(
        &self,
        kind: ScheduleKind,
        now: DateTime<Utc>,
        limit: u32,
        mut f: F,
    ) -> impl std::future::Future<Output = Result<usize, RepositoryError>> + Send
    where
        F: FnMut(StoredSchedule) -> Fut + Send,
        Fut: std::future::Future<Output = ScheduleUpdate> + Send,
    {
        async move {
            let due = self.find_due_schedules(kind, now, limit).await?;
            let mut advanced = 0;
            for schedule in due {
                let id = schedule.id;
                let expected = schedule.next_run_time;
                let update = f(schedule).await;
                if self.update_next_schedule_time(id, expected, &update).await? {
                    advanced += 1;
                } else {
                    tracing::debug!(schedule_id = id, "schedule was advanced concurrently");
                }
            }
            Ok(advanced)
        }
    }
}
