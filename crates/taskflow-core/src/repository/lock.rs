//! Per-task exclusive locks.
//!
//! Stores hand out a [`TaskLock`] for the duration of one callback or
//! enqueue. The lock serializes work on a task inside this process; across
//! processes the conditional state updates of the store remain the only
//! safety net.

use std::sync::Arc;

use dashmap::DashMap;
use taskflow_types::task::{StoredTask, TaskId};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-task async mutexes. Entries are dropped when unused.
#[derive(Default)]
pub struct TaskLocks {
    locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the task is free and take it.
    pub async fn acquire(&self, id: TaskId) -> TaskLockGuard<'_> {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        TaskLockGuard {
            table: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of tasks with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Releases the task on drop.
pub struct TaskLockGuard<'a> {
    table: &'a TaskLocks,
    id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table
            .locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// A locked task together with the row read while holding the lock.
pub struct TaskLock<'a> {
    pub task: StoredTask,
    _guard: TaskLockGuard<'a>,
}

impl<'a> TaskLock<'a> {
    pub fn new(task: StoredTask, guard: TaskLockGuard<'a>) -> Self {
        Self {
            task,
            _guard: guard,
        }
    }
}
