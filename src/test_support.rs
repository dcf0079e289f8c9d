use crate::config::ClientConfig;
use crate::integrations::sheets::{SheetError, SheetSource, SpreadsheetReader};
use crate::integrations::webapp::{HistorySyncWriter, HistoryTransport, TransportError};
use crate::models::{HistoryEntry, Lead, SYSTEM_ACTOR};
use crate::storage::StateHandle;
use crate::tenant::{SharedStore, SyncSettings, TenantContext, TenantStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub const LEADS_GID: u64 = 0;
pub const HISTORY_GID: u64 = 7;

pub fn lead(id: &str, name: &str, label: &str) -> Lead {
    Lead {
        id: id.to_string(),
        name: name.to_string(),
        current_label: label.to_string(),
        source: "Google Sheets".to_string(),
        ..Lead::default()
    }
}

pub fn ts(offset_ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::milliseconds(offset_ms)
}

pub fn entry_at(lead_id: &str, previous: &str, new: &str, offset_ms: i64) -> HistoryEntry {
    HistoryEntry::new(lead_id, "", previous, new, SYSTEM_ACTOR, None, ts(offset_ms))
}

pub fn shared_store(leads: Vec<Lead>) -> SharedStore {
    let mut store = TenantStore::load("test", StateHandle::in_memory()).expect("store");
    for lead in leads {
        store.history.upsert_lead(lead);
    }
    store.shared()
}

/// Serves canned CSV per gid, optionally slowly, and tracks concurrency.
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<HashMap<u64, Result<String, String>>>,
    delay: Mutex<Option<std::time::Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_csv(&self, gid: u64, csv: &str) {
        self.responses.lock().unwrap().insert(gid, Ok(csv.to_string()));
    }

    pub fn set_error(&self, gid: u64, reason: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(gid, Err(reason.to_string()));
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl SheetSource for ScriptedSource {
    fn fetch_csv(&self, sheet_id: &str, gid: u64) -> Result<String, SheetError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let response = self.responses.lock().unwrap().get(&gid).cloned();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            Some(Ok(csv)) => Ok(csv),
            Some(Err(reason)) => Err(SheetError::Fetch {
                sheet_id: sheet_id.to_string(),
                reason,
            }),
            None => Err(SheetError::EmptyData),
        }
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    name: &'static str,
    payloads: Mutex<Vec<String>>,
    delay: Option<std::time::Duration>,
}

impl RecordingTransport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Accepts every payload after sleeping for `delay`.
    pub fn slow(name: &'static str, delay: std::time::Duration) -> Self {
        Self {
            name,
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    /// Number of history rows across every recorded payload.
    pub fn rows(&self) -> usize {
        self.payloads()
            .iter()
            .map(|p| {
                let value: serde_json::Value = serde_json::from_str(p).expect("json");
                value["rows"].as_array().map(Vec::len).unwrap_or(0)
            })
            .sum()
    }
}

impl HistoryTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn send(&self, _endpoint: &str, payload: &str) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.payloads.lock().unwrap().push(payload.to_string());
        Ok(())
    }
}

pub struct FailingTransport {
    name: &'static str,
    calls: AtomicUsize,
}

impl FailingTransport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HistoryTransport for FailingTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn send(&self, _endpoint: &str, _payload: &str) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError {
            strategy: self.name,
            reason: "connection refused".to_string(),
        })
    }
}

pub fn client(id: &str) -> ClientConfig {
    ClientConfig {
        id: id.to_string(),
        name: format!("Client {id}"),
        sheet_id: format!("{id}-sheet"),
        history_webapp_url: "https://example.test/exec".to_string(),
        ..ClientConfig::default()
    }
}

/// Tenant wired to a scripted source and, when given, a single transport.
pub fn context(
    source: Arc<ScriptedSource>,
    transport: Option<Arc<dyn HistoryTransport>>,
) -> TenantContext {
    let client = client("acme");
    let reader = SpreadsheetReader::new(source, LEADS_GID, HISTORY_GID);
    let writer = transport.map(|t| HistorySyncWriter::new(&client.history_webapp_url, &client.sheet_id, vec![t]));
    let settings = SyncSettings {
        debounce: std::time::Duration::from_millis(100),
        ..SyncSettings::default()
    };
    TenantContext::new(client, StateHandle::in_memory(), reader, writer, settings).expect("context")
}
