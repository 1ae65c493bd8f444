//! Application-wide sync client.
//!
//! `SyncClient` owns one registry, store, status tracker and gateway for the
//! lifetime of the application state that creates it. Collections are
//! registered with a [`CollectionSpec`]; every entity type reuses the same
//! machinery keyed by its collection name.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::events::{EventBus, SyncEvent};
use super::gateway::MutationGateway;
use super::normalize::normalize_document;
use super::registry::SubscriptionRegistry;
use super::status::{CollectionStatus, LoadStatus, StatusTracker};
use super::store::{CollectionStore, Snapshot};
use super::{
    CollectionKey, CollectionSpec, Entity, EntityId, MutationResult, SpecTable, SyncConfig,
    SyncError, SyncResult,
};
use crate::remote::{Fields, Patch, Query, RemoteCollection};

/// Facade over the sync components
pub struct SyncClient {
    remote: Arc<dyn RemoteCollection>,
    specs: SpecTable,
    store: Arc<CollectionStore>,
    status: Arc<StatusTracker>,
    events: EventBus,
    registry: SubscriptionRegistry,
    gateway: MutationGateway,
}

impl SyncClient {
    pub fn new(remote: Arc<dyn RemoteCollection>) -> Self {
        Self::with_config(remote, SyncConfig::default())
    }

    pub fn with_config(remote: Arc<dyn RemoteCollection>, config: SyncConfig) -> Self {
        let specs: SpecTable = Arc::new(DashMap::new());
        let store = Arc::new(CollectionStore::new());
        let status = Arc::new(StatusTracker::new());
        let events = EventBus::new(config.event_capacity);
        let registry =
            SubscriptionRegistry::new(remote.clone(), store.clone(), status.clone(), events.clone());
        let gateway = MutationGateway::new(remote.clone(), specs.clone());

        Self {
            remote,
            specs,
            store,
            status,
            events,
            registry,
            gateway,
        }
    }

    /// Register a collection; replaces an earlier spec with the same key
    pub fn register(&self, spec: CollectionSpec) {
        debug!("Registered collection {}", spec.key);
        self.specs.insert(spec.key.clone(), Arc::new(spec));
    }

    pub fn spec(&self, key: &str) -> SyncResult<Arc<CollectionSpec>> {
        self.specs
            .get(key)
            .map(|s| s.clone())
            .ok_or_else(|| SyncError::UnknownCollection(key.to_string()))
    }

    pub fn collections(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self.specs.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    // ---- Subscription lifecycle ----

    /// Subscribe with the collection's default query
    pub fn subscribe(&self, key: &str) -> SyncResult<()> {
        let spec = self.spec(key)?;
        self.registry
            .subscribe(key, spec.query.clone(), spec.schema.clone())
    }

    /// Subscribe with an explicit query
    pub fn subscribe_with(&self, key: &str, query: Query) -> SyncResult<()> {
        let spec = self.spec(key)?;
        self.registry.subscribe(key, query, spec.schema.clone())
    }

    /// Re-run the last subscription of `key`, or the default one
    pub fn retry(&self, key: &str) -> SyncResult<()> {
        match self.registry.resubscribe(key) {
            Err(SyncError::NothingToRetry(_)) => self.subscribe(key),
            other => other,
        }
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.registry.unsubscribe(key)
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.registry.is_active(key)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // ---- Reads ----

    pub fn get_all(&self, key: &str) -> Arc<[Entity]> {
        self.store.get_all(key)
    }

    pub fn get_by_id(&self, key: &str, id: &str) -> Option<Entity> {
        self.store.get_by_id(key, id)
    }

    pub fn snapshot(&self, key: &str) -> Option<Arc<Snapshot>> {
        self.store.snapshot(key)
    }

    pub fn version(&self, key: &str) -> u64 {
        self.store.version(key)
    }

    pub fn view<T>(&self, key: &str, f: impl FnOnce(&[Entity]) -> T) -> T {
        self.store.view(key, f)
    }

    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    // ---- Status ----

    pub fn status(&self, key: &str) -> LoadStatus {
        self.status.status(key)
    }

    pub fn last_error(&self, key: &str) -> Option<String> {
        self.status.last_error(key)
    }

    pub fn collection_status(&self, key: &str) -> CollectionStatus {
        self.status.get(key)
    }

    pub fn clear_error(&self, key: &str) -> CollectionStatus {
        let status = self.status.clear_error(key);
        self.events.emit(SyncEvent::StatusChanged {
            key: key.to_string(),
            status: status.clone(),
        });
        status
    }

    // ---- Mutations ----

    pub async fn create(&self, key: &str, fields: Fields) -> MutationResult<EntityId> {
        self.gateway.create(key, fields).await
    }

    pub async fn update(&self, key: &str, id: &str, patch: Patch) -> MutationResult<()> {
        self.gateway.update(key, id, patch).await
    }

    pub async fn remove(&self, key: &str, id: &str) -> MutationResult<()> {
        self.gateway.remove(key, id).await
    }

    /// Unstamped patch, see [`MutationGateway::apply`]
    pub async fn apply(&self, key: &str, id: &str, patch: Patch) -> MutationResult<()> {
        self.gateway.apply(key, id, patch).await
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    // ---- One-shot reads ----

    /// Run a query once and normalize the result; the store is not touched
    pub async fn query_once(&self, key: &str, query: &Query) -> SyncResult<Vec<Entity>> {
        let spec = self.spec(key)?;
        let docs = self
            .remote
            .query_once(key, query)
            .await
            .map_err(|e| SyncError::Query(e.to_string()))?;
        Ok(docs
            .into_iter()
            .map(|doc| normalize_document(doc, &spec.schema))
            .collect())
    }

    /// Read one document from the backend, normalized
    pub async fn fetch(&self, key: &str, id: &str) -> SyncResult<Option<Entity>> {
        let spec = self.spec(key)?;
        let doc = self
            .remote
            .get(key, id)
            .await
            .map_err(|e| SyncError::Query(e.to_string()))?;
        Ok(doc.map(|doc| normalize_document(doc, &spec.schema)))
    }

    /// Raw backend access for collection-specific writes
    pub fn remote(&self) -> &Arc<dyn RemoteCollection> {
        &self.remote
    }

    // ---- Notifications ----

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Terminate every live subscription
    pub fn shutdown(&self) {
        let cancelled = self.registry.unsubscribe_all();
        info!("Sync client shut down ({} subscriptions cancelled)", cancelled);
    }
}
