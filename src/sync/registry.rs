//! Subscription registry: at most one live query per collection key.
//!
//! Subscribing cancels the previous handle for the key before the new live
//! query is registered, with the registry lock held across both steps. Each
//! subscription also gets a generation number. Callbacks check it before
//! touching the store, and unsubscribing removes it, so a listener that races
//! its own cancellation is ignored. A listener error also removes it: the
//! backend has terminated the live query, so the key no longer counts as
//! subscribed until it is re-subscribed.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::events::{EventBus, SyncEvent};
use super::normalize::{normalize_document, Schema};
use super::status::{CollectionStatus, StatusTracker};
use super::store::CollectionStore;
use super::{CollectionKey, SyncError, SyncResult};
use crate::remote::{Listener, ListenerHandle, Query, RawDocument, RemoteCollection, RemoteError};

struct ActiveSubscription {
    generation: u64,
    query: Query,
    handle: ListenerHandle,
}

/// Owner of the live subscriptions of one client
pub struct SubscriptionRegistry {
    remote: Arc<dyn RemoteCollection>,
    store: Arc<CollectionStore>,
    status: Arc<StatusTracker>,
    events: EventBus,
    active: Mutex<HashMap<CollectionKey, ActiveSubscription>>,
    /// Current generation per key; absent once unsubscribed or terminated
    generations: Arc<DashMap<CollectionKey, u64>>,
    /// Last query requested per key, kept across failures for retry
    last_queries: DashMap<CollectionKey, (Query, Schema)>,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(
        remote: Arc<dyn RemoteCollection>,
        store: Arc<CollectionStore>,
        status: Arc<StatusTracker>,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            store,
            status,
            events,
            active: Mutex::new(HashMap::new()),
            generations: Arc::new(DashMap::new()),
            last_queries: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start a live subscription on `key`, replacing any existing one.
    ///
    /// Marks the collection `loading`. If the backend refuses the query the
    /// collection is marked `failed` and the error is returned; the store
    /// keeps its previous contents either way.
    pub fn subscribe(&self, key: &str, query: Query, schema: Schema) -> SyncResult<()> {
        let mut active = self.active.lock();

        if let Some(previous) = active.remove(key) {
            debug!(
                "Cancelling subscription {} on {} before resubscribing",
                previous.generation, key
            );
            previous.handle.cancel();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.generations.insert(key.to_string(), generation);
        self.last_queries
            .insert(key.to_string(), (query.clone(), schema.clone()));
        self.emit_status(key, self.status.mark_loading(key));

        let listener = self.listener(key, generation, schema);
        match self.remote.live_query(key, &query, listener) {
            Ok(handle) => {
                info!("Subscribed to {} (generation {})", key, generation);
                active.insert(
                    key.to_string(),
                    ActiveSubscription {
                        generation,
                        query,
                        handle,
                    },
                );
                Ok(())
            }
            Err(err) => {
                warn!("Live query on {} refused: {}", key, err);
                self.generations.remove(key);
                self.emit_status(key, self.status.mark_failed(key, err.to_string()));
                Err(SyncError::Subscription(err.to_string()))
            }
        }
    }

    /// Re-run the last subscription requested for `key`
    pub fn resubscribe(&self, key: &str) -> SyncResult<()> {
        let (query, schema) = self
            .last_queries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::NothingToRetry(key.to_string()))?;
        self.subscribe(key, query, schema)
    }

    /// Terminate the subscription on `key`; a no-op if there is none.
    ///
    /// Returns whether a subscription was cancelled.
    pub fn unsubscribe(&self, key: &str) -> bool {
        let mut active = self.active.lock();
        let current = self.generations.remove(key).map(|(_, g)| g);

        match active.remove(key) {
            Some(subscription) if current != Some(subscription.generation) => {
                // Already terminated by the backend
                subscription.handle.cancel();
                false
            }
            Some(subscription) => {
                subscription.handle.cancel();
                info!("Unsubscribed from {} (generation {})", key, subscription.generation);
                self.events.emit(SyncEvent::Unsubscribed {
                    key: key.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Terminate every subscription
    pub fn unsubscribe_all(&self) -> usize {
        let keys = self.active_keys();
        keys.iter().filter(|key| self.unsubscribe(key)).count()
    }

    /// Whether `key` has a live query the backend has not terminated
    pub fn is_active(&self, key: &str) -> bool {
        self.active
            .lock()
            .get(key)
            .is_some_and(|s| self.is_live(key, s))
    }

    pub fn active_keys(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self
            .active
            .lock()
            .iter()
            .filter(|(key, s)| self.is_live(key, s))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn active_query(&self, key: &str) -> Option<Query> {
        self.active
            .lock()
            .get(key)
            .filter(|s| self.is_live(key, s))
            .map(|s| s.query.clone())
    }

    fn is_live(&self, key: &str, subscription: &ActiveSubscription) -> bool {
        self.generations.get(key).map(|g| *g) == Some(subscription.generation)
    }

    pub fn generation(&self, key: &str) -> Option<u64> {
        self.generations.get(key).map(|g| *g)
    }

    fn emit_status(&self, key: &str, status: CollectionStatus) {
        self.events.emit(SyncEvent::StatusChanged {
            key: key.to_string(),
            status,
        });
    }

    fn listener(&self, key: &str, generation: u64, schema: Schema) -> Listener {
        let on_data = SnapshotSink {
            key: key.to_string(),
            generation,
            generations: self.generations.clone(),
            store: self.store.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
        };
        let on_error = on_data.clone();

        Listener::new(
            move |docs| on_data.apply(docs, &schema),
            move |err| on_error.fail(err),
        )
    }
}

/// State captured by the callbacks of one subscription
#[derive(Clone)]
struct SnapshotSink {
    key: CollectionKey,
    generation: u64,
    generations: Arc<DashMap<CollectionKey, u64>>,
    store: Arc<CollectionStore>,
    status: Arc<StatusTracker>,
    events: EventBus,
}

impl SnapshotSink {
    fn apply(&self, docs: Vec<RawDocument>, schema: &Schema) {
        // The guard blocks unsubscribe until this snapshot is applied
        let current = self.generations.get(&self.key);
        if current.as_deref() != Some(&self.generation) {
            trace!("Dropping stale snapshot for {} (generation {})", self.key, self.generation);
            return;
        }

        let entities: Vec<_> = docs
            .into_iter()
            .map(|doc| normalize_document(doc, schema))
            .collect();
        let count = entities.len();
        let version = self.store.replace(&self.key, entities);
        let status = self.status.mark_succeeded(&self.key);
        drop(current);

        debug!("Applied snapshot {} of {} ({} entities)", version, self.key, count);
        self.events.emit(SyncEvent::SnapshotApplied {
            key: self.key.clone(),
            version,
            count,
        });
        self.events.emit(SyncEvent::StatusChanged {
            key: self.key.clone(),
            status,
        });
    }

    fn fail(&self, err: RemoteError) {
        let current = self.generations.get(&self.key);
        if current.as_deref() != Some(&self.generation) {
            trace!("Dropping stale error for {} (generation {})", self.key, self.generation);
            return;
        }

        warn!("Subscription to {} failed: {}", self.key, err);
        let status = self.status.mark_failed(&self.key, err.to_string());
        drop(current);
        // The backend detached this listener; retire its generation
        self.generations
            .remove_if(&self.key, |_, generation| *generation == self.generation);

        self.events.emit(SyncEvent::StatusChanged {
            key: self.key.clone(),
            status,
        });
    }
}
