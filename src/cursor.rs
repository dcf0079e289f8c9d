use crate::storage::{StateHandle, StoreError, tenant_key};
use std::collections::HashMap;
use std::ops::Range;
use tracing::warn;

/// Per-lead count of history entries already handed to the remote writer.
///
/// Cursors are created lazily and only move forward, except when removed
/// history positions below them are rebased away.
pub struct SyncCursors {
    key: String,
    positions: HashMap<String, usize>,
    state: StateHandle,
    dirty: bool,
}

impl SyncCursors {
    pub fn load(tenant: &str, state: StateHandle) -> Result<Self, StoreError> {
        let key = tenant_key(tenant, "cursors");
        let positions = state.load_json(&key)?;
        Ok(Self {
            key,
            positions,
            state,
            dirty: false,
        })
    }

    pub fn get(&self, lead_id: &str) -> usize {
        self.positions.get(lead_id).copied().unwrap_or(0)
    }

    /// Entries of a history of length `len` that have not been transmitted yet.
    pub fn pending_range(&self, lead_id: &str, len: usize) -> Range<usize> {
        self.get(lead_id).min(len)..len
    }

    /// Moves the cursor to `position` unless it is already further along.
    pub fn advance(&mut self, lead_id: &str, position: usize) -> usize {
        let current = self.positions.entry(lead_id.to_string()).or_insert(0);
        if position > *current {
            *current = position;
            let value = *current;
            self.dirty = true;
            return value;
        }
        *current
    }

    /// Shifts the cursor down by the number of `removed` history positions
    /// below it, so it keeps pointing at the first unsent entry after those
    /// positions were deleted from the lead's history.
    pub fn rebase(&mut self, lead_id: &str, removed: &[usize]) -> usize {
        let Some(current) = self.positions.get_mut(lead_id) else {
            return 0;
        };
        let below = removed.iter().filter(|&&position| position < *current).count();
        if below > 0 {
            *current -= below;
            self.dirty = true;
        }
        *current
    }

    pub fn tracked(&self) -> usize {
        self.positions.len()
    }

    /// Queues the collection for writing if anything changed since the last commit.
    pub fn commit(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if let Err(e) = self.state.save_json(&self.key, &self.positions) {
            warn!(error = %e, "failed to queue cursor persistence");
        }
    }
}
