//! Remote collection service contract.
//!
//! The sync core never talks to a concrete database. It consumes the
//! [`RemoteCollection`] trait: a live query that pushes complete snapshots to
//! a pair of callbacks, plus one-shot reads and acknowledged writes.
//!
//! Two implementations live in this crate:
//! - [`MemoryBackend`] keeps collections in memory and can hold snapshot
//!   delivery back, which makes the "write acknowledged, snapshot not yet
//!   arrived" window observable in tests
//! - [`crate::storage::SledCollections`] persists documents in sled

mod hub;
mod memory;
mod value;

pub use hub::ListenerHub;
pub use memory::MemoryBackend;
pub use value::{fields_from_json, BackendValue, Fields, RawDocument, Timestamp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the remote collection service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl RemoteError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        RemoteError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Equality filter on a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: BackendValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<BackendValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    fn matches(&self, doc: &RawDocument) -> bool {
        match (doc.get(&self.field), &self.value) {
            (Some(BackendValue::Integer(i)), BackendValue::Double(d))
            | (Some(BackendValue::Double(d)), BackendValue::Integer(i)) => *i as f64 == *d,
            (Some(v), expected) => v == expected,
            (None, _) => false,
        }
    }
}

/// Sort direction for ordered queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordering clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A collection query: conjunctive equality filters and an optional order.
///
/// Without an order, documents come back in backend key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    /// Query matching every document of the collection
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Reject queries the backend could not execute
    pub fn validate(&self) -> RemoteResult<()> {
        if let Some(filter) = self.filters.iter().find(|f| f.field.trim().is_empty()) {
            return Err(RemoteError::InvalidQuery(format!(
                "filter on empty field name (value {:?})",
                filter.value
            )));
        }
        if let Some(order) = &self.order_by {
            if order.field.trim().is_empty() {
                return Err(RemoteError::InvalidQuery("order by empty field name".to_string()));
            }
        }
        Ok(())
    }

    pub fn matches(&self, doc: &RawDocument) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter and order a full collection listing.
    ///
    /// Ordered queries drop documents missing the order field, like the
    /// hosted database does. The sort is stable, so ties keep key order.
    pub fn apply(&self, docs: impl IntoIterator<Item = RawDocument>) -> Vec<RawDocument> {
        let mut out: Vec<RawDocument> = docs.into_iter().filter(|d| self.matches(d)).collect();

        if let Some(order) = &self.order_by {
            out.retain(|d| d.get(&order.field).is_some());
            out.sort_by(|a, b| {
                let ord = match (a.get(&order.field), b.get(&order.field)) {
                    (Some(x), Some(y)) => x.total_cmp(y),
                    _ => Ordering::Equal,
                };
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        out
    }
}

/// A single field write within a [`Patch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldWrite {
    /// Overwrite the field
    Set(BackendValue),
    /// Remove the field
    Delete,
    /// Append each value not already present in the array field
    ArrayUnion(Vec<BackendValue>),
}

/// Partial update of a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub writes: BTreeMap<String, FieldWrite>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that sets every given field
    pub fn from_fields(fields: Fields) -> Self {
        Self {
            writes: fields
                .into_iter()
                .map(|(k, v)| (k, FieldWrite::Set(v)))
                .collect(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<BackendValue>) -> Self {
        self.writes.insert(field.into(), FieldWrite::Set(value.into()));
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.writes.insert(field.into(), FieldWrite::Delete);
        self
    }

    pub fn array_union(mut self, field: impl Into<String>, values: Vec<BackendValue>) -> Self {
        self.writes.insert(field.into(), FieldWrite::ArrayUnion(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.writes.contains_key(field)
    }

    /// Drop a field from the patch, returning its write if present
    pub fn remove(&mut self, field: &str) -> Option<FieldWrite> {
        self.writes.remove(field)
    }

    /// Apply the patch to stored fields
    pub fn apply_to(&self, fields: &mut Fields) {
        for (name, write) in &self.writes {
            match write {
                FieldWrite::Set(value) => {
                    fields.insert(name.clone(), value.clone());
                }
                FieldWrite::Delete => {
                    fields.remove(name);
                }
                FieldWrite::ArrayUnion(values) => {
                    let mut current = match fields.remove(name) {
                        Some(BackendValue::Array(items)) => items,
                        _ => Vec::new(),
                    };
                    for value in values {
                        if !current.contains(value) {
                            current.push(value.clone());
                        }
                    }
                    fields.insert(name.clone(), BackendValue::Array(current));
                }
            }
        }
    }
}

type SnapshotFn = dyn Fn(Vec<RawDocument>) + Send + Sync;
type ErrorFn = dyn Fn(RemoteError) + Send + Sync;

/// The pair of callbacks a live query pushes into
#[derive(Clone)]
pub struct Listener {
    on_data: Arc<SnapshotFn>,
    on_error: Arc<ErrorFn>,
}

impl Listener {
    pub fn new<D, E>(on_data: D, on_error: E) -> Self
    where
        D: Fn(Vec<RawDocument>) + Send + Sync + 'static,
        E: Fn(RemoteError) + Send + Sync + 'static,
    {
        Self {
            on_data: Arc::new(on_data),
            on_error: Arc::new(on_error),
        }
    }

    /// Deliver a complete snapshot
    pub fn deliver(&self, docs: Vec<RawDocument>) {
        (self.on_data)(docs)
    }

    /// Deliver a terminal error
    pub fn fail(&self, error: RemoteError) {
        (self.on_error)(error)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

/// Cancel capability of a live query.
///
/// Cancelling runs at most once; dropping an uncancelled handle cancels it.
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Handle whose cancellation does nothing
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// A hosted document collection service
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Start a live query. The listener receives the full matching contents
    /// of the collection once on attach and again after every change.
    fn live_query(
        &self,
        collection: &str,
        query: &Query,
        listener: Listener,
    ) -> RemoteResult<ListenerHandle>;

    /// Create a document, returning its backend-assigned id
    async fn insert(&self, collection: &str, fields: Fields) -> RemoteResult<String>;

    /// Update an existing document
    async fn patch(&self, collection: &str, id: &str, patch: Patch) -> RemoteResult<()>;

    /// Delete an existing document
    async fn erase(&self, collection: &str, id: &str) -> RemoteResult<()>;

    /// One-shot filtered read
    async fn query_once(&self, collection: &str, query: &Query) -> RemoteResult<Vec<RawDocument>>;

    /// One-shot read of a single document
    async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<RawDocument>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn doc(id: &str, promo: &str, price: i64) -> RawDocument {
        let mut fields = Fields::new();
        fields.insert("promocion".into(), promo.into());
        fields.insert("precio".into(), price.into());
        RawDocument::new(id, fields)
    }

    #[test]
    fn test_query_filter_and_order() {
        let docs = vec![doc("a", "si", 30), doc("b", "no", 10), doc("c", "si", 20)];
        let query = Query::all()
            .filter(Filter::eq("promocion", "si"))
            .order_by("precio", Direction::Ascending);

        let result = query.apply(docs);
        let ids: Vec<_> = result.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_order_drops_documents_without_field() {
        let mut missing = doc("z", "si", 0);
        missing.fields.remove("precio");
        let docs = vec![doc("a", "si", 5), missing];

        let result = Query::all()
            .order_by("precio", Direction::Descending)
            .apply(docs);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_query_validation() {
        assert!(Query::all().validate().is_ok());
        assert!(matches!(
            Query::all().filter(Filter::eq("", "x")).validate(),
            Err(RemoteError::InvalidQuery(_))
        ));
        assert!(Query::all().order_by(" ", Direction::Ascending).validate().is_err());
    }

    #[test]
    fn test_patch_array_union_skips_duplicates() {
        let mut fields = Fields::new();
        fields.insert("tags".into(), BackendValue::from(vec!["a"]));

        Patch::new()
            .array_union("tags", vec!["a".into(), "b".into()])
            .set("title", "Nuevo")
            .apply_to(&mut fields);

        assert_eq!(fields["tags"], BackendValue::from(vec!["a", "b"]));
        assert_eq!(fields["title"], BackendValue::from("Nuevo"));

        Patch::new().delete("title").apply_to(&mut fields);
        assert!(!fields.contains_key("title"));
    }

    #[test]
    fn test_listener_handle_cancels_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = ListenerHandle::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });
        handle.cancel();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);

        let counter = count.clone();
        {
            let _dropped = ListenerHandle::new(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }
}
