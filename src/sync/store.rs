//! Snapshot-replaced collection store.
//!
//! Each collection key holds one immutable [`Snapshot`]. A delivery swaps the
//! whole snapshot; readers clone the `Arc` and never observe a partially
//! applied collection. Between two replaces `get_all` hands out the same
//! allocation, so callers can compare with `Arc::ptr_eq` to skip work.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CollectionKey, Entity, EntityId};

/// Complete contents of one collection at one point in time
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Monotonic per key, starting at 1
    pub version: u64,
    /// Entities in backend order
    pub entities: Arc<[Entity]>,
    pub received_at: DateTime<Utc>,
    index: HashMap<EntityId, usize>,
}

impl Snapshot {
    fn new(version: u64, entities: Vec<Entity>) -> Self {
        let mut index = HashMap::with_capacity(entities.len());
        for (pos, entity) in entities.iter().enumerate() {
            index.entry(entity.id.clone()).or_insert(pos);
        }
        Self {
            version,
            entities: entities.into(),
            received_at: Utc::now(),
            index,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.index.get(id).map(|&pos| &self.entities[pos])
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// In-memory store of normalized collections
#[derive(Debug, Default)]
pub struct CollectionStore {
    slots: DashMap<CollectionKey, Arc<Snapshot>>,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of `key`, returning the new version
    pub(crate) fn replace(&self, key: &str, entities: Vec<Entity>) -> u64 {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Snapshot::new(0, Vec::new())));
        let version = slot.version + 1;
        *slot = Arc::new(Snapshot::new(version, entities));
        version
    }

    /// Latest entities of `key` in backend order; empty before the first snapshot
    pub fn get_all(&self, key: &str) -> Arc<[Entity]> {
        match self.slots.get(key) {
            Some(snapshot) => snapshot.entities.clone(),
            None => Arc::from(Vec::new()),
        }
    }

    pub fn get_by_id(&self, key: &str, id: &str) -> Option<Entity> {
        self.slots
            .get(key)
            .and_then(|snapshot| snapshot.get(id).cloned())
    }

    /// Version of the latest snapshot, 0 if none arrived yet
    pub fn version(&self, key: &str) -> u64 {
        self.slots.get(key).map(|s| s.version).unwrap_or(0)
    }

    pub fn snapshot(&self, key: &str) -> Option<Arc<Snapshot>> {
        self.slots.get(key).map(|s| s.clone())
    }

    /// Compute a derived view over the latest entities
    pub fn view<T>(&self, key: &str, f: impl FnOnce(&[Entity]) -> T) -> T {
        let entities = self.get_all(key);
        f(&entities)
    }

    pub fn keys(&self) -> Vec<CollectionKey> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn entity(id: &str, name: &str) -> Entity {
        let mut fields = Map::new();
        fields.insert("nombre".into(), json!(name));
        Entity::new(id, fields)
    }

    #[test]
    fn test_empty_before_first_snapshot() {
        let store = CollectionStore::new();
        assert!(store.get_all("productos").is_empty());
        assert_eq!(store.version("productos"), 0);
        assert!(store.get_by_id("productos", "p1").is_none());
    }

    #[test]
    fn test_replace_leaves_no_residue() {
        let store = CollectionStore::new();
        store.replace("productos", vec![entity("p1", "A"), entity("p2", "B"), entity("p3", "C")]);
        store.replace("productos", vec![entity("p3", "C2"), entity("p4", "D")]);

        let ids: Vec<_> = store.get_all("productos").iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["p3", "p4"]);
        assert!(store.get_by_id("productos", "p1").is_none());
        assert_eq!(
            store.get_by_id("productos", "p3").unwrap().get_str("nombre"),
            Some("C2")
        );
        assert_eq!(store.version("productos"), 2);
    }

    #[test]
    fn test_get_all_is_stable_between_replaces() {
        let store = CollectionStore::new();
        store.replace("blogs", vec![entity("b1", "A")]);

        let first = store.get_all("blogs");
        let second = store.get_all("blogs");
        assert!(Arc::ptr_eq(&first, &second));

        store.replace("blogs", vec![entity("b1", "A")]);
        assert!(!Arc::ptr_eq(&first, &store.get_all("blogs")));
    }

    #[test]
    fn test_keys_are_independent() {
        let store = CollectionStore::new();
        store.replace("blogs", vec![entity("b1", "A")]);
        store.replace("productos", vec![]);

        assert_eq!(store.get_all("blogs").len(), 1);
        assert!(store.get_all("productos").is_empty());
        assert_eq!(store.version("productos"), 1);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["blogs", "productos"]);
    }

    #[test]
    fn test_view_does_not_touch_store() {
        let store = CollectionStore::new();
        store.replace("productos", vec![entity("p1", "B"), entity("p2", "A")]);

        let sorted: Vec<String> = store.view("productos", |items| {
            let mut names: Vec<String> = items
                .iter()
                .filter_map(|e| e.get_str("nombre").map(str::to_string))
                .collect();
            names.sort();
            names
        });

        assert_eq!(sorted, vec!["A", "B"]);
        assert_eq!(store.get_all("productos")[0].id, "p1");
    }

    #[test]
    fn test_snapshot_lookup() {
        let store = CollectionStore::new();
        store.replace("blogs", vec![entity("b1", "A"), entity("b2", "B")]);

        let snapshot = store.snapshot("blogs").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("b2").unwrap().get_str("nombre"), Some("B"));
        assert!(snapshot.get("b3").is_none());
    }
}
