//! Delivery bookkeeping for history rows sent through the response-blind
//! append endpoint. The remote export is the only confirmation channel.

use crate::models::HistoryEntry;
use crate::storage::{StateHandle, StoreError, tenant_key};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    Pending,
    SentUnconfirmed,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    pub history_id: String,
    pub lead_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: usize,
    pub sent_unconfirmed: usize,
    pub confirmed: usize,
    pub failed: usize,
}

pub struct Outbox {
    key: String,
    records: BTreeMap<String, OutboxRecord>,
    state: StateHandle,
    dirty: bool,
}

impl Outbox {
    pub fn load(tenant: &str, state: StateHandle) -> Result<Self, StoreError> {
        let key = tenant_key(tenant, "outbox");
        let records = state.load_json(&key)?;
        Ok(Self {
            key,
            records,
            state,
            dirty: false,
        })
    }

    pub fn record(&self, history_id: &str) -> Option<&OutboxRecord> {
        self.records.get(history_id)
    }

    pub fn enqueue(&mut self, entry: &HistoryEntry) {
        if self.records.contains_key(&entry.history_id) {
            return;
        }
        self.records.insert(
            entry.history_id.clone(),
            OutboxRecord {
                history_id: entry.history_id.clone(),
                lead_id: entry.lead_id.clone(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                last_attempt: None,
            },
        );
        self.dirty = true;
    }

    pub fn mark_sent(&mut self, history_ids: &[String], at: DateTime<Utc>) {
        self.mark(history_ids, at, DeliveryStatus::SentUnconfirmed);
    }

    pub fn mark_failed(&mut self, history_ids: &[String], at: DateTime<Utc>) {
        self.mark(history_ids, at, DeliveryStatus::Failed);
    }

    /// A resend that did not go out. The record stays unconfirmed with the
    /// attempt counted; `due_for_resend` decides when it is exhausted.
    pub fn mark_resend_failed(&mut self, history_ids: &[String], at: DateTime<Utc>) {
        for id in history_ids {
            if let Some(record) = self.records.get_mut(id)
                && record.status == DeliveryStatus::SentUnconfirmed
            {
                record.attempts += 1;
                record.last_attempt = Some(at);
                self.dirty = true;
            }
        }
    }

    pub fn is_confirmed(&self, history_id: &str) -> bool {
        self.records
            .get(history_id)
            .is_some_and(|record| record.status == DeliveryStatus::Confirmed)
    }

    fn mark(&mut self, history_ids: &[String], at: DateTime<Utc>, status: DeliveryStatus) {
        for id in history_ids {
            let record = self.records.entry(id.clone()).or_insert_with(|| OutboxRecord {
                history_id: id.clone(),
                lead_id: String::new(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                last_attempt: None,
            });
            if record.status == DeliveryStatus::Confirmed {
                continue;
            }
            record.status = status;
            record.attempts += 1;
            record.last_attempt = Some(at);
        }
        self.dirty = true;
    }

    /// Marks every known id present in `remote_ids` as confirmed.
    pub fn confirm<'a>(&mut self, remote_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut confirmed = 0;
        for id in remote_ids {
            if let Some(record) = self.records.get_mut(id)
                && record.status != DeliveryStatus::Confirmed
            {
                record.status = DeliveryStatus::Confirmed;
                confirmed += 1;
            }
        }
        if confirmed > 0 {
            info!(confirmed, "remote history confirmed outbox records");
            self.dirty = true;
        }
        confirmed
    }

    /// Sent-but-unconfirmed records older than `ttl` that still have attempts left.
    /// Records that ran out of attempts are marked failed.
    pub fn due_for_resend(
        &mut self,
        now: DateTime<Utc>,
        ttl: Duration,
        max_attempts: u32,
    ) -> Vec<OutboxRecord> {
        let mut due = Vec::new();
        let mut exhausted = 0;
        for record in self.records.values_mut() {
            if record.status != DeliveryStatus::SentUnconfirmed {
                continue;
            }
            let stale = record.last_attempt.is_none_or(|at| now - at >= ttl);
            if !stale {
                continue;
            }
            if record.attempts >= max_attempts {
                record.status = DeliveryStatus::Failed;
                exhausted += 1;
                continue;
            }
            due.push(record.clone());
        }
        if exhausted > 0 {
            warn!(exhausted, "history rows never confirmed by the remote store");
            self.dirty = true;
        }
        due
    }

    pub fn counts(&self) -> OutboxCounts {
        let mut counts = OutboxCounts::default();
        for record in self.records.values() {
            match record.status {
                DeliveryStatus::Pending => counts.pending += 1,
                DeliveryStatus::SentUnconfirmed => counts.sent_unconfirmed += 1,
                DeliveryStatus::Confirmed => counts.confirmed += 1,
                DeliveryStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Queues the collection for writing if anything changed since the last commit.
    pub fn commit(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if let Err(e) = self.state.save_json(&self.key, &self.records) {
            warn!(error = %e, "failed to queue outbox persistence");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entry_at, ts};

    fn outbox() -> Outbox {
        Outbox::load("t1", StateHandle::in_memory()).expect("load")
    }

    #[test]
    fn lifecycle_pending_sent_confirmed() {
        let mut outbox = outbox();
        let entry = entry_at("L1", "", "NOVO", 0);
        outbox.enqueue(&entry);
        assert_eq!(outbox.counts().pending, 1);

        outbox.mark_sent(&[entry.history_id.clone()], ts(0));
        assert_eq!(
            outbox.record(&entry.history_id).map(|r| r.status),
            Some(DeliveryStatus::SentUnconfirmed)
        );

        assert_eq!(outbox.confirm([entry.history_id.as_str(), "unknown"]), 1);
        assert_eq!(outbox.confirm([entry.history_id.as_str()]), 0);
        assert_eq!(outbox.counts().confirmed, 1);
    }

    #[test]
    fn confirmed_records_are_not_downgraded() {
        let mut outbox = outbox();
        let entry = entry_at("L1", "", "NOVO", 0);
        outbox.enqueue(&entry);
        outbox.confirm([entry.history_id.as_str()]);
        outbox.mark_failed(&[entry.history_id.clone()], ts(10));
        assert_eq!(outbox.counts().confirmed, 1);
    }

    #[test]
    fn failed_resend_keeps_the_record_eligible() {
        let mut outbox = outbox();
        let entry = entry_at("L1", "", "NOVO", 0);
        let ids = [entry.history_id.clone()];
        outbox.enqueue(&entry);
        outbox.mark_sent(&ids, ts(0));

        let ttl = Duration::seconds(60);
        assert_eq!(outbox.due_for_resend(ts(61_000), ttl, 3).len(), 1);
        outbox.mark_resend_failed(&ids, ts(61_000));

        let record = outbox.record(&entry.history_id).expect("record");
        assert_eq!(record.status, DeliveryStatus::SentUnconfirmed);
        assert_eq!(record.attempts, 2);
        assert_eq!(outbox.due_for_resend(ts(122_000), ttl, 3).len(), 1);

        outbox.mark_resend_failed(&ids, ts(122_000));
        assert!(outbox.due_for_resend(ts(183_000), ttl, 3).is_empty());
        assert_eq!(outbox.counts().failed, 1);
    }

    #[test]
    fn stale_unconfirmed_rows_are_resent_until_attempts_run_out() {
        let mut outbox = outbox();
        let entry = entry_at("L1", "", "NOVO", 0);
        outbox.enqueue(&entry);
        outbox.mark_sent(&[entry.history_id.clone()], ts(0));

        let ttl = Duration::seconds(60);
        assert!(outbox.due_for_resend(ts(30_000), ttl, 2).is_empty());
        assert_eq!(outbox.due_for_resend(ts(61_000), ttl, 2).len(), 1);

        outbox.mark_sent(&[entry.history_id.clone()], ts(61_000));
        assert!(outbox.due_for_resend(ts(200_000), ttl, 2).is_empty());
        assert_eq!(outbox.counts().failed, 1);
    }
}
