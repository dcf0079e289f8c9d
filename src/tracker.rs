use crate::events::ChangeOrigin;
use crate::models::{HistoryEntry, LabelChange, display_label, labels_equal};
use crate::tenant::TenantContext;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum TrackOutcome {
    Applied(HistoryEntry),
    /// Previous and new label are the same label.
    Unchanged,
    /// A later call for the same lead arrived inside the debounce window.
    Superseded,
    /// The store already holds this transition.
    Duplicate,
    UnknownLead,
}

#[derive(Clone, Debug)]
pub struct TrackRequest {
    pub lead_id: String,
    pub previous_label: String,
    pub new_label: String,
    pub reason: Option<String>,
    pub actor: Option<String>,
}

/// Manual label changes. Calls for the same lead are debounced so a burst
/// collapses to its last call; different leads never delay each other.
pub struct LabelChangeTracker {
    ctx: TenantContext,
    generations: Arc<Mutex<HashMap<String, u64>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LabelChangeTracker {
    pub fn new(ctx: TenantContext) -> Self {
        Self {
            ctx,
            generations: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Schedules a label change and returns where its outcome will arrive.
    pub fn track(&self, request: TrackRequest) -> Receiver<TrackOutcome> {
        let (tx, rx) = mpsc::channel();
        if labels_equal(&request.previous_label, &request.new_label) {
            debug!(lead_id = %request.lead_id, "label unchanged; nothing to track");
            let _ = tx.send(TrackOutcome::Unchanged);
            return rx;
        }

        let generation = {
            let mut generations = self
                .generations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = generations.entry(request.lead_id.clone()).or_insert(0);
            *slot += 1;
            *slot
        };

        let ctx = self.ctx.clone();
        let generations = Arc::clone(&self.generations);
        let handle = thread::spawn(move || {
            thread::sleep(ctx.settings.debounce);
            {
                let mut generations = generations.lock().unwrap_or_else(PoisonError::into_inner);
                if generations.get(&request.lead_id) != Some(&generation) {
                    let _ = tx.send(TrackOutcome::Superseded);
                    return;
                }
                generations.remove(&request.lead_id);
            }

            let outcome = apply(&ctx, &request);
            let applied = matches!(outcome, TrackOutcome::Applied(_));
            let _ = tx.send(outcome);

            if applied
                && let Some(writer) = &ctx.writer
                && let Err(e) = writer.sync_pending(&ctx.store, &request.lead_id)
            {
                warn!(lead_id = %request.lead_id, error = %e, "manual history sync failed");
            }
        });

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
        rx
    }

    /// Blocks until every scheduled change, and its remote sync, has finished.
    pub fn wait_idle(&self) {
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn apply(ctx: &TenantContext, request: &TrackRequest) -> TrackOutcome {
    let entry = {
        let mut store = ctx.lock();
        let Some(lead) = store.history.lead(&request.lead_id) else {
            warn!(lead_id = %request.lead_id, "label change for unknown lead ignored");
            return TrackOutcome::UnknownLead;
        };
        let actor = request
            .actor
            .as_deref()
            .map(str::trim)
            .filter(|actor| !actor.is_empty())
            .unwrap_or(&ctx.settings.actor)
            .to_string();
        let entry = HistoryEntry::new(
            &lead.id,
            &lead.name,
            &request.previous_label,
            &request.new_label,
            &actor,
            request.reason.clone().filter(|r| !r.trim().is_empty()),
            Utc::now(),
        );

        if !store.append(entry.clone()).is_appended() {
            return TrackOutcome::Duplicate;
        }
        store
            .history
            .set_current_label(&request.lead_id, request.new_label.trim());
        store.dedupe(&request.lead_id);
        entry
    };

    info!(
        lead_id = %entry.lead_id,
        from = %entry.previous_label,
        to = %entry.new_label,
        actor = %entry.actor,
        "label change recorded"
    );
    ctx.events.notify(
        vec![LabelChange {
            lead_id: entry.lead_id.clone(),
            lead_name: entry.lead_name.clone(),
            previous_label: display_label(&entry.previous_label).to_string(),
            new_label: display_label(&entry.new_label).to_string(),
        }],
        ChangeOrigin::Manual,
    );
    TrackOutcome::Applied(entry)
}
