//! Incremental status propagation.
//!
//! Follows the store's `change_seq` feed with a cursor and turns every changed
//! row into propagation candidates: the row's parent may now promote BLOCKED
//! children or become done, and the row itself may do the same if it just
//! became PLANNED or SUCCESS.

use std::collections::BTreeSet;

use taskflow_types::error::RepositoryError;
use taskflow_types::task::{TaskId, TaskStateCode, TaskStateSummary};

use crate::repository::session::SessionStore;

/// Tasks to re-evaluate after a batch of changes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropagationCandidates {
    /// Tasks whose BLOCKED children may be promotable.
    pub parents: BTreeSet<TaskId>,
    /// Tasks that may be PLANNED with all children done.
    pub planned: BTreeSet<TaskId>,
}

impl PropagationCandidates {
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty() && self.planned.is_empty()
    }

    fn add(&mut self, row: &TaskStateSummary) {
        if let Some(parent) = row.parent_id {
            self.parents.insert(parent);
            self.planned.insert(parent);
        }
        if row.state.can_run_children() {
            self.parents.insert(row.id);
        }
        if row.state == TaskStateCode::Planned {
            self.planned.insert(row.id);
        }
    }
}

/// Cursor over the change feed. Owned by one executor instance.
#[derive(Debug)]
pub struct StatusPropagator {
    last_seq: i64,
    page_size: u32,
}

impl StatusPropagator {
    pub fn new(page_size: u32) -> Self {
        Self {
            last_seq: 0,
            page_size: page_size.max(1),
        }
    }

    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    /// Read the next page of changes and advance the cursor. `None` once the
    /// feed is drained.
    pub async fn next_candidates<S: SessionStore>(
        &mut self,
        store: &S,
    ) -> Result<Option<PropagationCandidates>, RepositoryError> {
        let rows = store
            .find_recently_changed_tasks(self.last_seq, self.page_size)
            .await?;
        let Some(last) = rows.last() else {
            return Ok(None);
        };
        self.last_seq = last.change_seq;

        let mut candidates = PropagationCandidates::default();
        for row in &rows {
            candidates.add(row);
        }
        Ok(Some(candidates))
    }
}
