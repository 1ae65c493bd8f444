//! Change notifications for the UI layer.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::{CollectionKey, CollectionStatus};

/// Events emitted by the sync core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A snapshot replaced the store contents of a collection
    SnapshotApplied {
        key: CollectionKey,
        version: u64,
        count: usize,
    },
    /// Load status or last error changed
    StatusChanged {
        key: CollectionKey,
        status: CollectionStatus,
    },
    /// The live subscription of a collection was terminated
    Unsubscribed { key: CollectionKey },
}

impl SyncEvent {
    pub fn key(&self) -> &str {
        match self {
            SyncEvent::SnapshotApplied { key, .. }
            | SyncEvent::StatusChanged { key, .. }
            | SyncEvent::Unsubscribed { key } => key,
        }
    }
}

/// Broadcast fan-out of [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Send an event; having no receivers is not an error
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event receivers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
