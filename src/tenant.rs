//! Per-tenant wiring. Everything a sync path needs is built here explicitly
//! and handed around by handle; nothing is process-global.

use crate::config::{ClientConfig, Config, SyncConfig};
use crate::cursor::SyncCursors;
use crate::events::EventBus;
use crate::history::{AppendOutcome, HistoryStore};
use crate::integrations::sheets::{HttpSheetSource, SheetSource, SpreadsheetReader};
use crate::integrations::webapp::{HistorySyncWriter, http_transports};
use crate::models::HistoryEntry;
use crate::outbox::Outbox;
use crate::storage::{StateHandle, StoreError, tenant_key};
use anyhow::{Context, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

/// Mutable state of one tenant. Always accessed through [`SharedStore`].
pub struct TenantStore {
    pub history: HistoryStore,
    pub cursors: SyncCursors,
    pub outbox: Outbox,
}

pub type SharedStore = Arc<Mutex<TenantStore>>;

/// Exclusive access to a tenant's store. Whatever changed while the guard was
/// held is serialized once, when it is released.
pub struct StoreGuard<'a>(MutexGuard<'a, TenantStore>);

impl Deref for StoreGuard<'_> {
    type Target = TenantStore;

    fn deref(&self) -> &TenantStore {
        &self.0
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut TenantStore {
        &mut self.0
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.0.commit();
    }
}

pub fn lock_store(store: &SharedStore) -> StoreGuard<'_> {
    StoreGuard(store.lock().unwrap_or_else(PoisonError::into_inner))
}

const TENANT_DOCUMENTS: [&str; 4] = ["leads", "cursors", "outbox", "scheduler"];

/// Drops every persisted document of a removed client.
pub fn purge_tenant(state: &StateHandle, tenant: &str) {
    for name in TENANT_DOCUMENTS {
        state.remove(&tenant_key(tenant, name));
    }
    info!(tenant, "tenant data removed");
}

impl TenantStore {
    pub fn load(tenant: &str, state: StateHandle) -> Result<Self, StoreError> {
        Ok(Self {
            history: HistoryStore::load(tenant, state.clone())?,
            cursors: SyncCursors::load(tenant, state.clone())?,
            outbox: Outbox::load(tenant, state)?,
        })
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// History append that also opens an outbox record for new entries.
    pub fn append(&mut self, entry: HistoryEntry) -> AppendOutcome {
        let queued = entry.clone();
        let outcome = self.history.append(entry);
        if outcome.is_appended() {
            self.outbox.enqueue(&queued);
        }
        outcome
    }

    /// Collapses duplicate history of one lead and keeps its cursor on the
    /// same first unsent entry. Returns how many entries were removed.
    pub fn dedupe(&mut self, lead_id: &str) -> usize {
        let removed = self.history.dedupe(lead_id);
        self.cursors.rebase(lead_id, &removed);
        removed.len()
    }

    pub fn dedupe_all(&mut self) -> usize {
        self.history
            .dedupe_all()
            .into_iter()
            .map(|(lead_id, removed)| {
                self.cursors.rebase(&lead_id, &removed);
                removed.len()
            })
            .sum()
    }

    pub fn commit(&mut self) {
        self.history.commit();
        self.cursors.commit();
        self.outbox.commit();
    }

    /// Leads whose cursor has not reached the end of their history.
    pub fn leads_with_pending(&self) -> Vec<String> {
        self.history
            .leads()
            .iter()
            .filter(|lead| {
                !self
                    .cursors
                    .pending_range(&lead.id, lead.history.len())
                    .is_empty()
            })
            .map(|lead| lead.id.clone())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub interval: Duration,
    pub debounce: Duration,
    pub actor: String,
    pub confirm_after: chrono::Duration,
    pub max_resend_attempts: u32,
}

impl SyncSettings {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            interval: sync.interval(),
            debounce: sync.debounce(),
            actor: sync.actor.clone(),
            confirm_after: chrono::Duration::seconds(sync.confirm_after_secs as i64),
            max_resend_attempts: sync.max_resend_attempts,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Clone)]
pub struct TenantContext {
    pub client: ClientConfig,
    pub store: SharedStore,
    pub reader: SpreadsheetReader,
    pub writer: Option<Arc<HistorySyncWriter>>,
    pub events: EventBus,
    pub settings: SyncSettings,
    pub state: StateHandle,
}

impl TenantContext {
    pub fn new(
        client: ClientConfig,
        state: StateHandle,
        reader: SpreadsheetReader,
        writer: Option<HistorySyncWriter>,
        settings: SyncSettings,
    ) -> Result<Self, StoreError> {
        let store = TenantStore::load(&client.id, state.clone())?.shared();
        Ok(Self {
            client,
            store,
            reader,
            writer: writer.map(Arc::new),
            events: EventBus::new(),
            settings,
            state,
        })
    }

    /// Builds the HTTP-backed context for a configured client.
    pub fn open(config: &Config, client_key: &str, state: StateHandle) -> Result<Self> {
        let client = config
            .resolved_client(client_key)
            .with_context(|| format!("unknown client: {client_key}"))?;
        let timeout = config.sync.request_timeout();

        let source: Arc<dyn SheetSource> =
            Arc::new(HttpSheetSource::new(&config.sheets.export_base_url, timeout)?);
        let reader = SpreadsheetReader::new(
            source,
            config.sheets.leads_gid,
            config.sheets.history_gid,
        );

        let writer = if client.has_history_sink() {
            let sheet_id = if client.has_history_sheet() {
                &client.history_sheet_id
            } else {
                &client.sheet_id
            };
            Some(HistorySyncWriter::new(
                &client.history_webapp_url,
                sheet_id,
                http_transports(timeout).context("failed to create HTTP client")?,
            ))
        } else {
            None
        };

        let context = Self::new(
            client,
            state,
            reader,
            writer,
            SyncSettings::from_config(&config.sync),
        )?;
        Ok(context)
    }

    pub fn tenant_id(&self) -> &str {
        &self.client.id
    }

    pub fn lock(&self) -> StoreGuard<'_> {
        lock_store(&self.store)
    }

    pub fn flush(&self) {
        self.state.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entry_at, lead, shared_store};

    #[test]
    fn append_opens_outbox_record_only_for_new_entries() {
        let store = shared_store(vec![lead("L1", "Ana", "")]);
        let entry = entry_at("L1", "", "NOVO", 0);
        let mut guard = lock_store(&store);

        assert!(guard.append(entry.clone()).is_appended());
        assert!(!guard.append(entry.clone()).is_appended());
        assert_eq!(guard.outbox.counts().pending, 1);
        assert_eq!(guard.leads_with_pending(), vec!["L1".to_string()]);

        guard.cursors.advance("L1", 1);
        assert!(guard.leads_with_pending().is_empty());
    }

    #[test]
    fn dedupe_keeps_unsent_entries_ahead_of_the_cursor() {
        let mut l1 = lead("L1", "Ana", "");
        l1.history = vec![entry_at("L1", "", "FECHADO", 0), entry_at("L1", "", "FECHADO", 400)];
        let store = shared_store(vec![l1]);
        let mut guard = lock_store(&store);
        guard.cursors.advance("L1", 2);
        assert!(guard.append(entry_at("L1", "FECHADO", "PERDIDO", 5_000)).is_appended());

        assert_eq!(guard.dedupe("L1"), 1);
        assert_eq!(guard.cursors.get("L1"), 1);
        let pending = guard.cursors.pending_range("L1", guard.history.entries("L1").len());
        assert_eq!(guard.history.entries("L1")[pending][0].new_label, "PERDIDO");
        assert_eq!(guard.dedupe_all(), 0);
    }

    #[test]
    fn releasing_the_guard_persists_changes_once() {
        let state = StateHandle::in_memory();
        let store = TenantStore::load("acme", state.clone()).expect("load").shared();
        {
            let mut guard = lock_store(&store);
            for idx in 0..50 {
                guard.history.upsert_lead(lead(&format!("L{idx}"), "Ana", ""));
            }
        }
        state.flush();
        let reloaded = TenantStore::load("acme", state).expect("reload");
        assert_eq!(reloaded.history.leads().len(), 50);
    }

    #[test]
    fn tenants_do_not_share_state() {
        let state = StateHandle::in_memory();
        let mut a = TenantStore::load("a", state.clone()).expect("a");
        a.history.upsert_lead(lead("L1", "Ana", ""));
        a.append(entry_at("L1", "", "NOVO", 0));
        a.commit();
        state.flush();

        let b = TenantStore::load("b", state).expect("b");
        assert!(b.history.leads().is_empty());
        assert_eq!(b.outbox.counts().pending, 0);
    }

    #[test]
    fn purging_a_tenant_leaves_other_tenants_alone() {
        let state = StateHandle::in_memory();
        for tenant in ["gone", "kept"] {
            let mut store = TenantStore::load(tenant, state.clone()).expect("load");
            store.history.upsert_lead(lead("L1", "Ana", ""));
            store.append(entry_at("L1", "", "NOVO", 0));
            store.cursors.advance("L1", 1);
            store.commit();
        }
        state.flush();

        purge_tenant(&state, "gone");
        state.flush();

        let gone = TenantStore::load("gone", state.clone()).expect("gone");
        assert!(gone.history.leads().is_empty());
        assert_eq!(gone.cursors.get("L1"), 0);
        assert_eq!(gone.outbox.counts().pending, 0);
        let kept = TenantStore::load("kept", state).expect("kept");
        assert_eq!(kept.history.leads().len(), 1);
        assert_eq!(kept.cursors.get("L1"), 1);
    }
}
