//! Response-blind writer for the remote label-history sheet.
//!
//! The append endpoint is a spreadsheet web app that never answers in a way we
//! can read, so "success" only means a transport handed the request off
//! without an error. Delivery is confirmed later through the history export.

use crate::models::HistoryEntry;
use crate::tenant::{SharedStore, lock_store};
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest payload the query-string transport will put into a URL.
pub const MAX_QUERY_PAYLOAD: usize = 8000;

#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("no history endpoint configured")]
    NoEndpoint,
    #[error("all {attempts} transports failed: {last}")]
    AllStrategiesFailed { attempts: usize, last: String },
}

impl TransmissionError {
    pub fn message(&self) -> String {
        match self {
            TransmissionError::NoEndpoint => {
                "This client has no history endpoint configured.".to_string()
            }
            TransmissionError::AllStrategiesFailed { last, .. } => {
                format!("Could not send label history ({last}). It will be retried on the next sync.")
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("{strategy}: {reason}")]
pub struct TransportError {
    pub strategy: &'static str,
    pub reason: String,
}

/// One way of handing a payload to the append endpoint.
pub trait HistoryTransport: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError>;
}

/// Plain-text POST, the closest thing to a browser beacon.
pub struct BeaconTransport {
    client: Client,
}

/// Form POST with the JSON in a `payload` field.
pub struct FormTransport {
    client: Client,
}

/// GET with the JSON in a `data` query parameter.
pub struct QueryTransport {
    client: Client,
    max_payload: usize,
}

impl HistoryTransport for BeaconTransport {
    fn name(&self) -> &'static str {
        "beacon"
    }

    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError> {
        self.client
            .post(endpoint)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(payload.to_string())
            .send()
            .map(|_| ())
            .map_err(|e| transport_error(self.name(), e))
    }
}

impl HistoryTransport for FormTransport {
    fn name(&self) -> &'static str {
        "form-post"
    }

    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError> {
        self.client
            .post(endpoint)
            .form(&[("payload", payload)])
            .send()
            .map(|_| ())
            .map_err(|e| transport_error(self.name(), e))
    }
}

impl HistoryTransport for QueryTransport {
    fn name(&self) -> &'static str {
        "query-get"
    }

    fn send(&self, endpoint: &str, payload: &str) -> Result<(), TransportError> {
        if payload.len() > self.max_payload {
            return Err(TransportError {
                strategy: self.name(),
                reason: format!("payload of {} bytes is too long for a URL", payload.len()),
            });
        }
        self.client
            .get(endpoint)
            .query(&[("data", payload)])
            .send()
            .map(|_| ())
            .map_err(|e| transport_error(self.name(), e))
    }
}

fn transport_error(strategy: &'static str, err: reqwest::Error) -> TransportError {
    TransportError {
        strategy,
        reason: err.to_string(),
    }
}

/// Beacon, then form POST, then query GET, sharing one client.
pub fn http_transports(timeout: Duration) -> Result<Vec<Arc<dyn HistoryTransport>>, reqwest::Error> {
    let client = Client::builder().timeout(timeout).build()?;
    let transports: Vec<Arc<dyn HistoryTransport>> = vec![
        Arc::new(BeaconTransport {
            client: client.clone(),
        }),
        Arc::new(FormTransport {
            client: client.clone(),
        }),
        Arc::new(QueryTransport {
            client,
            max_payload: MAX_QUERY_PAYLOAD,
        }),
    ];
    Ok(transports)
}

/// Hands `payload` to the first transport that does not fail and returns its name.
pub fn deliver(
    endpoint: &str,
    payload: &str,
    transports: &[Arc<dyn HistoryTransport>],
) -> Result<&'static str, TransmissionError> {
    if endpoint.trim().is_empty() {
        return Err(TransmissionError::NoEndpoint);
    }
    let mut last = String::from("no transports configured");
    for (attempt, transport) in transports.iter().enumerate() {
        match transport.send(endpoint.trim(), payload) {
            Ok(()) => return Ok(transport.name()),
            Err(e) => {
                debug!(attempt, error = %e, "transport failed; trying next");
                last = e.to_string();
            }
        }
    }
    Err(TransmissionError::AllStrategiesFailed {
        attempts: transports.len(),
        last,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendPayload<'a> {
    action: &'static str,
    sheet_id: &'a str,
    lead_id: &'a str,
    rows: Vec<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransmitReceipt {
    pub strategy: Option<&'static str>,
    pub rows: usize,
}

pub struct HistorySyncWriter {
    endpoint: String,
    sheet_id: String,
    transports: Vec<Arc<dyn HistoryTransport>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Marks one lead as being synced; released on drop.
struct LeadClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    lead_id: String,
}

impl Drop for LeadClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.lead_id);
    }
}

impl HistorySyncWriter {
    pub fn new(
        endpoint: &str,
        sheet_id: &str,
        transports: Vec<Arc<dyn HistoryTransport>>,
    ) -> Self {
        Self {
            endpoint: endpoint.trim().to_string(),
            sheet_id: sheet_id.trim().to_string(),
            transports,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, lead_id: &str) -> Option<LeadClaim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.insert(lead_id.to_string()).then(|| LeadClaim {
            in_flight: &self.in_flight,
            lead_id: lead_id.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hands `entries` to the first transport that does not fail. No retries
    /// happen here; the next scheduler tick picks up whatever is still pending.
    pub fn transmit(
        &self,
        lead_id: &str,
        entries: &[HistoryEntry],
    ) -> Result<TransmitReceipt, TransmissionError> {
        if entries.is_empty() {
            return Ok(TransmitReceipt {
                strategy: None,
                rows: 0,
            });
        }
        if self.endpoint.is_empty() {
            return Err(TransmissionError::NoEndpoint);
        }

        let payload = AppendPayload {
            action: "appendHistory",
            sheet_id: &self.sheet_id,
            lead_id,
            rows: entries.iter().map(HistoryEntry::to_row).collect(),
        };
        let payload = serde_json::to_string(&payload).map_err(|e| {
            TransmissionError::AllStrategiesFailed {
                attempts: 0,
                last: format!("payload serialization: {e}"),
            }
        })?;

        match deliver(&self.endpoint, &payload, &self.transports) {
            Ok(strategy) => {
                info!(
                    lead_id,
                    rows = entries.len(),
                    strategy,
                    "history rows handed to remote endpoint"
                );
                Ok(TransmitReceipt {
                    strategy: Some(strategy),
                    rows: entries.len(),
                })
            }
            Err(e) => {
                warn!(lead_id, error = %e, "every history transport failed");
                Err(e)
            }
        }
    }

    /// Sends the entries past the lead's cursor. The cursor moves to the end
    /// of the sent range only when a transport accepted the batch.
    ///
    /// One sync per lead at a time: a call for a lead that is already being
    /// sent returns `Ok(0)`, and whatever it would have sent stays pending.
    /// Rows the remote export already shows are skipped.
    pub fn sync_pending(&self, store: &SharedStore, lead_id: &str) -> Result<usize, TransmissionError> {
        let Some(_claim) = self.claim(lead_id) else {
            debug!(lead_id, "history sync for this lead already running");
            return Ok(0);
        };

        let (pending, end) = {
            let mut guard = lock_store(store);
            let store = &mut *guard;
            let entries = store.history.entries(lead_id);
            let range = store.cursors.pending_range(lead_id, entries.len());
            let end = range.end;
            let pending: Vec<HistoryEntry> = entries[range]
                .iter()
                .filter(|entry| !store.outbox.is_confirmed(&entry.history_id))
                .cloned()
                .collect();
            for entry in &pending {
                store.outbox.enqueue(entry);
            }
            if pending.is_empty() {
                store.cursors.advance(lead_id, end);
            }
            (pending, end)
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = pending.iter().map(|e| e.history_id.clone()).collect();
        let result = self.transmit(lead_id, &pending);

        let mut store = lock_store(store);
        match result {
            Ok(receipt) => {
                store.cursors.advance(lead_id, end);
                store.outbox.mark_sent(&ids, Utc::now());
                Ok(receipt.rows)
            }
            Err(e) => {
                store.outbox.mark_failed(&ids, Utc::now());
                Err(e)
            }
        }
    }
}
