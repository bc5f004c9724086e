//! In-process change bus.
//!
//! Every mutation of the store publishes one event on a tokio broadcast
//! channel. Delivery is at-least-once per live subscriber; a receiver that
//! lags far enough to observe `RecvError::Lagged` should re-sync from the
//! store. Observers dedupe by `(type, memory_hash, at)`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffered capacity per subscriber.
const CHANNEL_CAPACITY: usize = 1024;

/// A change to the store, published in commit order within this process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeEvent {
    #[serde(rename_all = "camelCase")]
    Created {
        memory_hash: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        memory_hash: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Deleted {
        memory_hash: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Archived {
        memory_hash: String,
        /// False when the memory was unarchived.
        archived: bool,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ConsolidationRun {
        pass: String,
        status: String,
        /// Items touched, keyed by what the pass counts.
        counts: std::collections::BTreeMap<String, i64>,
        at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    /// The memory this event concerns, when it concerns exactly one.
    pub fn memory_hash(&self) -> Option<&str> {
        match self {
            ChangeEvent::Created { memory_hash, .. }
            | ChangeEvent::Updated { memory_hash, .. }
            | ChangeEvent::Deleted { memory_hash, .. }
            | ChangeEvent::Archived { memory_hash, .. } => Some(memory_hash),
            ChangeEvent::ConsolidationRun { .. } => None,
        }
    }
}

/// Publisher half of the change bus.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Publishing with no subscribers
    /// is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
