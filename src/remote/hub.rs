//! Listener bookkeeping shared by the backends.
//!
//! The hub owns every registered live query, evaluates queries against the
//! current collection contents and pushes snapshots. Deliveries for the whole
//! hub are serialized through one re-entrant lock and always read the latest
//! collection state while holding it, so a listener can never observe an older
//! snapshot after a newer one.

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{Listener, ListenerHandle, Query, RawDocument, RemoteError, RemoteResult};

struct Registration {
    id: u64,
    collection: String,
    query: Query,
    listener: Listener,
}

enum Payload {
    Data(Vec<RawDocument>),
    Error(RemoteError),
}

struct Pending {
    listener_id: u64,
    listener: Listener,
    payload: Payload,
}

/// Per-collection listener counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub registered: u64,
    pub cancelled: u64,
}

/// Registry of live queries for one backend
pub struct ListenerHub {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Registration>>,
    /// Serializes deliveries; re-entrant so a callback may attach a listener
    delivery: ReentrantMutex<()>,
    /// Deliveries waiting for `flush` while delivery is held
    held: Mutex<Option<VecDeque<Pending>>>,
    stats: DashMap<String, ListenerStats>,
}

impl ListenerHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
            held: Mutex::new(None),
            stats: DashMap::new(),
        }
    }

    /// Register a live query and push its initial snapshot.
    ///
    /// `load` returns the current contents of the collection; it runs under
    /// the delivery lock. A failed load registers nothing.
    pub fn register<F>(
        self: &Arc<Self>,
        collection: &str,
        query: &Query,
        listener: Listener,
        load: F,
    ) -> RemoteResult<ListenerHandle>
    where
        F: FnOnce() -> RemoteResult<Vec<RawDocument>>,
    {
        let _guard = self.delivery.lock();
        let docs = query.apply(load()?);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Registration {
            id,
            collection: collection.to_string(),
            query: query.clone(),
            listener: listener.clone(),
        });
        self.stats.entry(collection.to_string()).or_default().registered += 1;
        debug!("Listener {} attached to {}", id, collection);

        self.dispatch(Pending {
            listener_id: id,
            listener,
            payload: Payload::Data(docs),
        });

        let hub = Arc::downgrade(self);
        let collection = collection.to_string();
        Ok(ListenerHandle::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.detach(&collection, id);
            }
        }))
    }

    /// Push the current contents of `collection` to all of its listeners.
    ///
    /// When `load` fails the listeners are terminated with the error instead.
    pub fn publish<F>(&self, collection: &str, load: F)
    where
        F: FnOnce() -> RemoteResult<Vec<RawDocument>>,
    {
        let _guard = self.delivery.lock();

        let targets: Vec<(u64, Query, Listener)> = self
            .listeners
            .lock()
            .iter()
            .filter(|r| r.collection == collection)
            .map(|r| (r.id, r.query.clone(), r.listener.clone()))
            .collect();

        if targets.is_empty() {
            return;
        }

        let docs = match load() {
            Ok(docs) => docs,
            Err(error) => {
                warn!("Failed to load {} for listeners: {}", collection, error);
                self.fail(collection, error);
                return;
            }
        };
        trace!(
            "Publishing {} documents of {} to {} listeners",
            docs.len(),
            collection,
            targets.len()
        );

        for (id, query, listener) in targets {
            let matching = query.apply(docs.iter().cloned());
            self.dispatch(Pending {
                listener_id: id,
                listener,
                payload: Payload::Data(matching),
            });
        }
    }

    /// Terminate every listener on `collection` with an error
    pub fn fail(&self, collection: &str, error: RemoteError) {
        let _guard = self.delivery.lock();

        let failed: Vec<Registration> = {
            let mut listeners = self.listeners.lock();
            let (failed, kept): (Vec<_>, Vec<_>) =
                listeners.drain(..).partition(|r| r.collection == collection);
            *listeners = kept;
            failed
        };

        for registration in failed {
            self.dispatch(Pending {
                listener_id: registration.id,
                listener: registration.listener,
                payload: Payload::Error(error.clone()),
            });
        }
    }

    /// Queue deliveries instead of running them until [`flush`](Self::flush)
    pub fn hold(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(VecDeque::new());
        }
    }

    /// Whether deliveries are currently being queued
    pub fn is_holding(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Number of queued deliveries
    pub fn pending(&self) -> usize {
        self.held.lock().as_ref().map(|q| q.len()).unwrap_or(0)
    }

    /// Run every queued delivery in order and keep holding.
    ///
    /// Snapshots for listeners cancelled in the meantime are discarded;
    /// errors are always delivered since the listener is already detached.
    /// Returns the number of callbacks invoked.
    pub fn flush(&self) -> usize {
        let _guard = self.delivery.lock();

        let pending: Vec<Pending> = match self.held.lock().as_mut() {
            Some(queue) => queue.drain(..).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for item in pending {
            let live = matches!(item.payload, Payload::Error(_)) || self.is_registered(item.listener_id);
            if live {
                Self::invoke(item);
                delivered += 1;
            }
        }
        delivered
    }

    /// Flush and stop holding
    pub fn release(&self) -> usize {
        let _guard = self.delivery.lock();
        let delivered = self.flush();
        *self.held.lock() = None;
        delivered
    }

    pub fn active_count(&self, collection: &str) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|r| r.collection == collection)
            .count()
    }

    pub fn stats(&self, collection: &str) -> ListenerStats {
        self.stats.get(collection).map(|s| *s).unwrap_or_default()
    }

    fn detach(&self, collection: &str, id: u64) {
        let removed = {
            let mut listeners = self.listeners.lock();
            let before = listeners.len();
            listeners.retain(|r| r.id != id);
            listeners.len() < before
        };
        if removed {
            self.stats.entry(collection.to_string()).or_default().cancelled += 1;
            debug!("Listener {} detached from {}", id, collection);
        }
    }

    fn is_registered(&self, id: u64) -> bool {
        self.listeners.lock().iter().any(|r| r.id == id)
    }

    fn dispatch(&self, item: Pending) {
        {
            let mut held = self.held.lock();
            if let Some(queue) = held.as_mut() {
                queue.push_back(item);
                return;
            }
        }
        Self::invoke(item);
    }

    fn invoke(item: Pending) {
        match item.payload {
            Payload::Data(docs) => item.listener.deliver(docs),
            Payload::Error(error) => item.listener.fail(error),
        }
    }
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Fields, Filter};

    fn recording_listener() -> (Listener, Arc<Mutex<Vec<usize>>>, Arc<Mutex<Vec<RemoteError>>>) {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (s, e) = (sizes.clone(), errors.clone());
        let listener = Listener::new(
            move |docs| s.lock().push(docs.len()),
            move |err| e.lock().push(err),
        );
        (listener, sizes, errors)
    }

    fn docs(n: usize) -> Vec<RawDocument> {
        (0..n)
            .map(|i| RawDocument::new(format!("doc-{}", i), Fields::new()))
            .collect()
    }

    #[test]
    fn test_register_delivers_initial_snapshot() {
        let hub = Arc::new(ListenerHub::new());
        let (listener, sizes, _) = recording_listener();

        let _handle = hub.register("blogs", &Query::all(), listener, || Ok(docs(2))).unwrap();

        assert_eq!(*sizes.lock(), vec![2]);
        assert_eq!(hub.active_count("blogs"), 1);
    }

    #[test]
    fn test_publish_applies_query() {
        let hub = Arc::new(ListenerHub::new());
        let (listener, sizes, _) = recording_listener();
        let query = Query::all().filter(Filter::eq("promocion", "si"));

        let _handle = hub.register("productos", &query, listener, || Ok(Vec::new())).unwrap();

        let mut fields = Fields::new();
        fields.insert("promocion".into(), "si".into());
        hub.publish("productos", || {
            Ok(vec![
                RawDocument::new("a", fields.clone()),
                RawDocument::new("b", Fields::new()),
            ])
        });

        assert_eq!(*sizes.lock(), vec![0, 1]);
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let hub = Arc::new(ListenerHub::new());
        let (listener, sizes, _) = recording_listener();

        let handle = hub.register("blogs", &Query::all(), listener, || Ok(Vec::new())).unwrap();
        handle.cancel();
        hub.publish("blogs", || Ok(docs(3)));

        assert_eq!(*sizes.lock(), vec![0]);
        assert_eq!(hub.stats("blogs"), ListenerStats { registered: 1, cancelled: 1 });
    }

    #[test]
    fn test_held_deliveries_flush_in_order() {
        let hub = Arc::new(ListenerHub::new());
        hub.hold();
        let (listener, sizes, _) = recording_listener();

        let _handle = hub.register("blogs", &Query::all(), listener, || Ok(docs(1))).unwrap();
        hub.publish("blogs", || Ok(docs(2)));
        assert!(sizes.lock().is_empty());
        assert_eq!(hub.pending(), 2);

        assert_eq!(hub.flush(), 2);
        assert_eq!(*sizes.lock(), vec![1, 2]);
        assert!(hub.is_holding());

        hub.release();
        assert!(!hub.is_holding());
    }

    #[test]
    fn test_held_snapshot_dropped_after_cancel() {
        let hub = Arc::new(ListenerHub::new());
        hub.hold();
        let (listener, sizes, _) = recording_listener();

        let handle = hub.register("blogs", &Query::all(), listener, || Ok(docs(1))).unwrap();
        handle.cancel();

        assert_eq!(hub.flush(), 0);
        assert!(sizes.lock().is_empty());
    }

    #[test]
    fn test_fail_detaches_and_reports() {
        let hub = Arc::new(ListenerHub::new());
        let (listener, _, errors) = recording_listener();

        let _handle = hub.register("blogs", &Query::all(), listener, || Ok(Vec::new())).unwrap();
        hub.fail("blogs", RemoteError::PermissionDenied("blogs".into()));

        assert_eq!(errors.lock().len(), 1);
        assert_eq!(hub.active_count("blogs"), 0);
    }

    #[test]
    fn test_failed_load_terminates_listeners() {
        let hub = Arc::new(ListenerHub::new());
        let (listener, sizes, errors) = recording_listener();

        let _handle = hub.register("blogs", &Query::all(), listener, || Ok(docs(2))).unwrap();
        hub.publish("blogs", || Err(RemoteError::Storage("disk".into())));

        assert_eq!(*sizes.lock(), vec![2]);
        assert_eq!(*errors.lock(), vec![RemoteError::Storage("disk".into())]);
        assert_eq!(hub.active_count("blogs"), 0);
    }

    #[test]
    fn test_failed_initial_load_registers_nothing() {
        let hub = Arc::new(ListenerHub::new());
        let (listener, sizes, _) = recording_listener();

        let result = hub.register("blogs", &Query::all(), listener, || {
            Err(RemoteError::Unavailable("offline".into()))
        });

        assert!(result.is_err());
        assert!(sizes.lock().is_empty());
        assert_eq!(hub.active_count("blogs"), 0);
        assert_eq!(hub.stats("blogs").registered, 0);
    }
}
