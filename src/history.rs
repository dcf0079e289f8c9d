//! Per-lead label history: append-only, idempotent on `history_id`, and
//! collapsing entries that repeat the same label within one second.

use crate::models::{HistoryEntry, Lead, label_key};
use crate::storage::{StateHandle, StoreError, tenant_key};
use chrono::Duration;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Two entries with the same new label closer than this are one transition.
pub const COLLISION_WINDOW_MS: i64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    DuplicateHistoryId,
    Collision,
    UnknownLead,
}

impl AppendOutcome {
    pub fn is_appended(self) -> bool {
        self == AppendOutcome::Appended
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateSummary {
    pub lead_id: String,
    pub lead_name: String,
    pub duplicates: usize,
}

pub fn entries_collide(a: &HistoryEntry, b: &HistoryEntry) -> bool {
    if label_key(&a.new_label) != label_key(&b.new_label) {
        return false;
    }
    let gap = (a.timestamp - b.timestamp).abs();
    gap <= Duration::milliseconds(COLLISION_WINDOW_MS)
}

pub struct HistoryStore {
    key: String,
    leads: Vec<Lead>,
    state: StateHandle,
    dirty: bool,
}

impl HistoryStore {
    pub fn load(tenant: &str, state: StateHandle) -> Result<Self, StoreError> {
        let key = tenant_key(tenant, "leads");
        let leads: Vec<Lead> = state.load_json(&key)?;
        debug!(tenant, leads = leads.len(), "history store loaded");
        Ok(Self {
            key,
            leads,
            state,
            dirty: false,
        })
    }

    pub fn leads(&self) -> &[Lead] {
        &self.leads
    }

    pub fn lead(&self, lead_id: &str) -> Option<&Lead> {
        self.leads.iter().find(|lead| lead.id == lead_id)
    }

    /// Looks a lead up by id, then by case-insensitive name.
    pub fn find_lead(&self, id_or_name: &str) -> Option<&Lead> {
        let key = id_or_name.trim();
        self.lead(key).or_else(|| {
            self.leads
                .iter()
                .find(|lead| lead.name.trim().eq_ignore_ascii_case(key))
        })
    }

    fn lead_mut(&mut self, lead_id: &str) -> Option<&mut Lead> {
        self.leads.iter_mut().find(|lead| lead.id == lead_id)
    }

    /// Inserts a new lead or refreshes the spreadsheet fields of a known one.
    /// The history of an existing lead is never replaced.
    pub fn upsert_lead(&mut self, lead: Lead) {
        match self.lead_mut(&lead.id) {
            Some(existing) => existing.absorb_fields(&lead),
            None => self.leads.push(lead),
        }
        self.dirty = true;
    }

    pub fn set_current_label(&mut self, lead_id: &str, label: &str) -> bool {
        let Some(lead) = self.lead_mut(lead_id) else {
            return false;
        };
        lead.current_label = label.trim().to_string();
        self.dirty = true;
        true
    }

    pub fn append(&mut self, entry: HistoryEntry) -> AppendOutcome {
        let Some(lead) = self.lead_mut(&entry.lead_id) else {
            warn!(lead_id = %entry.lead_id, "history append for unknown lead ignored");
            return AppendOutcome::UnknownLead;
        };

        if lead.history.iter().any(|e| e.history_id == entry.history_id) {
            debug!(history_id = %entry.history_id, "history entry already present");
            return AppendOutcome::DuplicateHistoryId;
        }
        if lead.history.iter().any(|e| entries_collide(e, &entry)) {
            debug!(
                lead_id = %entry.lead_id,
                label = %entry.new_label,
                "history entry collides with a recent one; dropped"
            );
            return AppendOutcome::Collision;
        }

        lead.history.push(entry);
        self.dirty = true;
        AppendOutcome::Appended
    }

    /// History ordered by timestamp for display; insertion order breaks ties.
    pub fn get_history(&self, lead_id: &str) -> Vec<HistoryEntry> {
        let mut history = self.entries(lead_id).to_vec();
        history.sort_by_key(|entry| entry.timestamp);
        history
    }

    /// History in write order, which is what sync cursors index into.
    pub fn entries(&self, lead_id: &str) -> &[HistoryEntry] {
        self.lead(lead_id)
            .map(|lead| lead.history.as_slice())
            .unwrap_or(&[])
    }

    /// Label of the latest entry by timestamp, or "" when the lead has none.
    pub fn find_last_label(&self, lead_id: &str) -> String {
        self.entries(lead_id)
            .iter()
            .enumerate()
            .max_by_key(|(idx, entry)| (entry.timestamp, *idx))
            .map(|(_, entry)| entry.new_label.trim().to_string())
            .unwrap_or_default()
    }

    /// Collapses duplicate entries of one lead and returns the write-order
    /// positions that were removed, ascending. Sync cursors index into that
    /// order, so callers holding cursors must rebase them.
    pub fn dedupe(&mut self, lead_id: &str) -> Vec<usize> {
        let Some(lead) = self.lead_mut(lead_id) else {
            return Vec::new();
        };
        let removed = dedupe_entries(&mut lead.history);
        if !removed.is_empty() {
            debug!(lead_id, removed = removed.len(), "collapsed duplicate history entries");
            self.dirty = true;
        }
        removed
    }

    /// [`HistoryStore::dedupe`] for every lead, keyed by lead id.
    pub fn dedupe_all(&mut self) -> Vec<(String, Vec<usize>)> {
        let mut removed = Vec::new();
        for lead in &mut self.leads {
            let positions = dedupe_entries(&mut lead.history);
            if !positions.is_empty() {
                removed.push((lead.id.clone(), positions));
            }
        }
        if !removed.is_empty() {
            self.dirty = true;
        }
        removed
    }

    pub fn duplicate_report(&self) -> Vec<DuplicateSummary> {
        self.leads
            .iter()
            .filter_map(|lead| {
                let mut history = lead.history.clone();
                let duplicates = dedupe_entries(&mut history).len();
                (duplicates > 0).then(|| DuplicateSummary {
                    lead_id: lead.id.clone(),
                    lead_name: lead.name.clone(),
                    duplicates,
                })
            })
            .collect()
    }

    pub fn contains_history_id(&self, history_id: &str) -> bool {
        self.leads
            .iter()
            .any(|lead| lead.history.iter().any(|e| e.history_id == history_id))
    }

    /// Queues the collection for writing if anything changed since the last commit.
    pub fn commit(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if let Err(e) = self.state.save_json(&self.key, &self.leads) {
            warn!(error = %e, "failed to queue lead persistence");
        }
    }
}

/// Keeps the first-seen entry of every colliding group; returns the removed positions.
fn dedupe_entries(history: &mut Vec<HistoryEntry>) -> Vec<usize> {
    let mut kept: Vec<HistoryEntry> = Vec::with_capacity(history.len());
    let mut removed = Vec::new();
    let mut seen_ids = HashSet::new();
    for (position, entry) in history.drain(..).enumerate() {
        if !seen_ids.insert(entry.history_id.clone())
            || kept.iter().any(|k| entries_collide(k, &entry))
        {
            removed.push(position);
            continue;
        }
        kept.push(entry);
    }
    *history = kept;
    removed
}
