use crate::models::LabelChange;
use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Poll,
    Manual,
    Import,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeNotification {
    pub changes: Vec<LabelChange>,
    pub timestamp: DateTime<Utc>,
    pub origin: ChangeOrigin,
}

/// In-process fan-out of change notifications. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ChangeNotification>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChangeNotification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Delivers to every live subscriber and forgets the ones that hung up.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, notification: ChangeNotification) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
        debug!(
            changes = notification.changes.len(),
            origin = ?notification.origin,
            subscribers = subscribers.len(),
            "change notification published"
        );
        subscribers.len()
    }

    pub fn notify(&self, changes: Vec<LabelChange>, origin: ChangeOrigin) -> usize {
        self.publish(ChangeNotification {
            changes,
            timestamp: Utc::now(),
            origin,
        })
    }
}
