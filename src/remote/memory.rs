//! In-memory remote collection service.
//!
//! Behaves like the hosted database from the client's point of view: ids are
//! assigned on insert, every acknowledged write is followed by a snapshot push
//! to the live queries on that collection, and listing order is key order.
//! Tests can hold snapshot delivery back and inject failures.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use super::{
    Fields, ListenerHub, Listener, ListenerHandle, Patch, Query, RawDocument, RemoteCollection,
    RemoteError, RemoteResult,
};

type Collection = BTreeMap<String, Fields>;

/// Remote collection service backed by process memory
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
    hub: Arc<ListenerHub>,
    /// Errors returned by the next writes, in order
    write_failures: Mutex<VecDeque<RemoteError>>,
    /// Collections whose live queries are refused
    denied: RwLock<HashMap<String, RemoteError>>,
}

impl MemoryBackend {
    /// Backend that pushes snapshots as soon as a write is acknowledged
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            hub: Arc::new(ListenerHub::new()),
            write_failures: Mutex::new(VecDeque::new()),
            denied: RwLock::new(HashMap::new()),
        }
    }

    /// Backend that queues snapshots until [`flush`](Self::flush)
    pub fn held() -> Self {
        let backend = Self::new();
        backend.hub.hold();
        backend
    }

    pub fn hub(&self) -> &Arc<ListenerHub> {
        &self.hub
    }

    /// Deliver queued snapshots; returns the number of callbacks invoked
    pub fn flush(&self) -> usize {
        self.hub.flush()
    }

    /// Store a document directly, with a snapshot push
    pub fn seed(&self, collection: &str, id: &str, fields: Fields) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        self.publish(collection);
    }

    /// Make the next write fail with `error`
    pub fn fail_next_write(&self, error: RemoteError) {
        self.write_failures.lock().push_back(error);
    }

    /// Terminate every live query on `collection` with `error`
    pub fn fail_listeners(&self, collection: &str, error: RemoteError) {
        self.hub.fail(collection, error);
    }

    /// Refuse future live queries on `collection`
    pub fn deny(&self, collection: &str, error: RemoteError) {
        self.denied.write().insert(collection.to_string(), error);
    }

    pub fn allow(&self, collection: &str) {
        self.denied.write().remove(collection);
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn snapshot(&self, collection: &str) -> Vec<RawDocument> {
        self.collections
            .read()
            .get(collection)
            .map(|c| {
                c.iter()
                    .map(|(id, fields)| RawDocument::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish(&self, collection: &str) {
        self.hub.publish(collection, || Ok(self.snapshot(collection)));
    }

    fn take_failure(&self) -> RemoteResult<()> {
        match self.write_failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCollection for MemoryBackend {
    fn live_query(
        &self,
        collection: &str,
        query: &Query,
        listener: Listener,
    ) -> RemoteResult<ListenerHandle> {
        query.validate()?;
        if let Some(error) = self.denied.read().get(collection) {
            return Err(error.clone());
        }
        self.hub
            .register(collection, query, listener, || Ok(self.snapshot(collection)))
    }

    async fn insert(&self, collection: &str, fields: Fields) -> RemoteResult<String> {
        self.take_failure()?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        debug!("Inserted {}/{}", collection, id);
        self.publish(collection);
        Ok(id)
    }

    async fn patch(&self, collection: &str, id: &str, patch: Patch) -> RemoteResult<()> {
        self.take_failure()?;
        {
            let mut collections = self.collections.write();
            let fields = collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(id))
                .ok_or_else(|| RemoteError::not_found(collection, id))?;
            patch.apply_to(fields);
        }
        self.publish(collection);
        Ok(())
    }

    async fn erase(&self, collection: &str, id: &str) -> RemoteResult<()> {
        self.take_failure()?;
        let removed = self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|c| c.remove(id));
        if removed.is_none() {
            return Err(RemoteError::not_found(collection, id));
        }
        self.publish(collection);
        Ok(())
    }

    async fn query_once(&self, collection: &str, query: &Query) -> RemoteResult<Vec<RawDocument>> {
        query.validate()?;
        Ok(query.apply(self.snapshot(collection)))
    }

    async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<RawDocument>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|fields| RawDocument::new(id, fields.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{BackendValue, Filter};

    fn recorder() -> (Listener, Arc<Mutex<Vec<Vec<RawDocument>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Listener::new(move |docs| sink.lock().push(docs), |_| {}), seen)
    }

    fn product(name: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("nombre".into(), name.into());
        fields
    }

    #[tokio::test]
    async fn test_insert_pushes_snapshot() {
        let backend = MemoryBackend::new();
        let (listener, seen) = recorder();
        let _handle = backend.live_query("productos", &Query::all(), listener).unwrap();

        let id = backend.insert("productos", product("Crema")).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_empty());
        assert_eq!(seen[1][0].id, id);
    }

    #[tokio::test]
    async fn test_patch_and_erase_missing_document() {
        let backend = MemoryBackend::new();

        let err = backend.patch("productos", "nope", Patch::new()).await.unwrap_err();
        assert_eq!(err, RemoteError::not_found("productos", "nope"));

        let err = backend.erase("productos", "nope").await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_held_backend_delays_snapshot() {
        let backend = MemoryBackend::held();
        let (listener, seen) = recorder();
        let _handle = backend.live_query("productos", &Query::all(), listener).unwrap();

        backend.insert("productos", product("Crema")).await.unwrap();
        assert!(seen.lock().is_empty());

        backend.flush();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let backend = MemoryBackend::new();
        backend.fail_next_write(RemoteError::PermissionDenied("productos".into()));

        assert!(backend.insert("productos", product("A")).await.is_err());
        assert!(backend.insert("productos", product("B")).await.is_ok());
        assert_eq!(backend.document_count("productos"), 1);
    }

    #[tokio::test]
    async fn test_query_once_and_get() {
        let backend = MemoryBackend::new();
        let mut promo = product("Promo");
        promo.insert("promocion".into(), BackendValue::from("si"));
        backend.seed("productos", "p1", promo);
        backend.seed("productos", "p2", product("Normal"));

        let query = Query::all().filter(Filter::eq("promocion", "si"));
        let found = backend.query_once("productos", &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "p1");

        assert!(backend.get("productos", "p2").await.unwrap().is_some());
        assert!(backend.get("productos", "p3").await.unwrap().is_none());
    }

    #[test]
    fn test_denied_live_query() {
        let backend = MemoryBackend::new();
        backend.deny("blogs", RemoteError::PermissionDenied("blogs".into()));
        let (listener, _) = recorder();

        assert!(backend.live_query("blogs", &Query::all(), listener.clone()).is_err());

        backend.allow("blogs");
        assert!(backend.live_query("blogs", &Query::all(), listener).is_ok());
    }
}
