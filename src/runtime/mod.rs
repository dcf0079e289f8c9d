pub mod scheduler;

use crate::detector::{MatchAmbiguity, detect};
use crate::events::ChangeOrigin;
use crate::integrations::sheets::SheetError;
use crate::models::{HistoryEntry, LabelChange, Lead};
use crate::tenant::TenantContext;
use chrono::Utc;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Fetch(#[from] SheetError),
}

impl TickError {
    pub fn message(&self) -> String {
        match self {
            TickError::Fetch(e) => e.message(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub fetched: usize,
    pub inserted: usize,
    pub changes: Vec<LabelChange>,
    pub appended: usize,
    pub transmitted: usize,
    pub transmit_failures: Vec<(String, String)>,
    pub ambiguities: Vec<MatchAmbiguity>,
    pub reconcile: ReconcileReport,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub remote_rows: usize,
    pub confirmed: usize,
    pub merged: usize,
    pub resent: usize,
    pub error: Option<String>,
}

/// One sync pass: fetch, detect, record, transmit, reconcile, notify.
///
/// Only a failed lead fetch is an error. Transmission and reconciliation
/// problems are logged and reported; they are retried on the next pass.
pub fn tick(ctx: &TenantContext, origin: ChangeOrigin) -> Result<TickReport, TickError> {
    let tenant = ctx.tenant_id();
    let fetched = match ctx.reader.fetch_leads(&ctx.client.sheet_id) {
        Ok(leads) => leads,
        Err(SheetError::EmptyData) => {
            debug!(tenant, "lead sheet has no rows");
            Vec::new()
        }
        Err(e) => {
            warn!(tenant, error = %e, "lead fetch failed");
            return Err(e.into());
        }
    };

    let mut report = TickReport {
        fetched: fetched.len(),
        ..TickReport::default()
    };
    record_changes(ctx, &fetched, &mut report);
    transmit_pending(ctx, &mut report);
    report.reconcile = reconcile(ctx);

    if !report.changes.is_empty() {
        ctx.events.notify(report.changes.clone(), origin);
    }
    info!(
        tenant,
        fetched = report.fetched,
        changes = report.changes.len(),
        appended = report.appended,
        transmitted = report.transmitted,
        "sync pass finished"
    );
    Ok(report)
}

fn record_changes(ctx: &TenantContext, fetched: &[Lead], report: &mut TickReport) {
    let mut store = ctx.lock();
    let detection = detect(fetched, &store.history);

    for (row, matched) in fetched.iter().zip(&detection.matches) {
        if store.history.lead(&matched.lead_id).is_none() {
            report.inserted += 1;
        }
        let mut refreshed = row.clone();
        refreshed.id = matched.lead_id.clone();
        refreshed.history.clear();
        store.history.upsert_lead(refreshed);
    }

    let now = Utc::now();
    for change in &detection.changes {
        let entry = HistoryEntry::new(
            &change.lead_id,
            &change.lead_name,
            &change.previous_label,
            &change.new_label,
            &ctx.settings.actor,
            None,
            now,
        );
        if store.append(entry).is_appended() {
            report.appended += 1;
        }
    }

    report.changes = detection.changes;
    report.ambiguities = detection.ambiguities;
}

/// Every lead with entries past its cursor is retried, not only this pass's changes.
fn transmit_pending(ctx: &TenantContext, report: &mut TickReport) {
    let Some(writer) = &ctx.writer else {
        return;
    };
    let pending = ctx.lock().leads_with_pending();
    for lead_id in pending {
        match writer.sync_pending(&ctx.store, &lead_id) {
            Ok(rows) => report.transmitted += rows,
            Err(e) => {
                warn!(tenant = ctx.tenant_id(), lead_id = %lead_id, error = %e, "history transmission failed");
                report.transmit_failures.push((lead_id, e.message()));
            }
        }
    }
}

/// Reads the remote history sheet, confirms delivered rows, merges rows
/// recorded elsewhere, and resends rows that were never confirmed.
pub fn reconcile(ctx: &TenantContext) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    if !ctx.client.has_history_sheet() {
        return report;
    }

    let remote = match ctx.reader.fetch_history(&ctx.client.history_sheet_id) {
        Ok(rows) => rows,
        Err(SheetError::EmptyData) => Vec::new(),
        Err(e) => {
            warn!(tenant = ctx.tenant_id(), error = %e, "remote history fetch failed");
            report.error = Some(e.message());
            return report;
        }
    };
    report.remote_rows = remote.len();

    {
        let mut guard = ctx.lock();
        let store = &mut *guard;
        report.confirmed = store
            .outbox
            .confirm(remote.iter().map(|e| e.history_id.as_str()));

        for mut entry in remote {
            let local_id = match store.history.lead(&entry.lead_id) {
                Some(lead) => lead.id.clone(),
                None => match store.history.leads().iter().find(|lead| {
                    !entry.lead_name.trim().is_empty()
                        && lead.name.trim().eq_ignore_ascii_case(entry.lead_name.trim())
                }) {
                    Some(lead) => lead.id.clone(),
                    None => {
                        debug!(lead_id = %entry.lead_id, "remote history row for unknown lead skipped");
                        continue;
                    }
                },
            };
            entry.lead_id = local_id.clone();

            let before = store.history.entries(&local_id).len();
            let fully_sent = store.cursors.get(&local_id) >= before;
            if store.history.append(entry.clone()).is_appended() {
                report.merged += 1;
                store.outbox.enqueue(&entry);
                store.outbox.confirm([entry.history_id.as_str()]);
                if fully_sent {
                    store.cursors.advance(&local_id, before + 1);
                }
            }
        }
    }

    report.resent = resend_unconfirmed(ctx);
    if report.confirmed > 0 || report.merged > 0 {
        info!(
            tenant = ctx.tenant_id(),
            confirmed = report.confirmed,
            merged = report.merged,
            "remote history reconciled"
        );
    }
    report
}

fn resend_unconfirmed(ctx: &TenantContext) -> usize {
    let Some(writer) = &ctx.writer else {
        return 0;
    };

    let batches: BTreeMap<String, Vec<HistoryEntry>> = {
        let mut store = ctx.lock();
        let due = store.outbox.due_for_resend(
            Utc::now(),
            ctx.settings.confirm_after,
            ctx.settings.max_resend_attempts,
        );
        let mut batches: BTreeMap<String, Vec<HistoryEntry>> = BTreeMap::new();
        for record in due {
            if let Some(entry) = store
                .history
                .entries(&record.lead_id)
                .iter()
                .find(|e| e.history_id == record.history_id)
            {
                batches
                    .entry(record.lead_id.clone())
                    .or_default()
                    .push(entry.clone());
            }
        }
        batches
    };

    let mut resent = 0;
    for (lead_id, entries) in batches {
        let ids: Vec<String> = entries.iter().map(|e| e.history_id.clone()).collect();
        let result = writer.transmit(&lead_id, &entries);
        let mut store = ctx.lock();
        match result {
            Ok(receipt) => {
                resent += receipt.rows;
                store.outbox.mark_sent(&ids, Utc::now());
            }
            Err(e) => {
                warn!(lead_id = %lead_id, error = %e, "history resend failed");
                store.outbox.mark_resend_failed(&ids, Utc::now());
            }
        }
    }
    resent
}
