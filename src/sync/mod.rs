//! Real-time collection synchronization.
//!
//! This module keeps client-side copies of remote document collections:
//! - Schema-driven normalization of backend values
//! - One live subscription per collection key
//! - Snapshot-replaced, versioned collection store
//! - Fire-and-forget mutation gateway
//! - Per-collection load status and change notifications

pub mod client;
pub mod events;
pub mod gateway;
pub mod normalize;
pub mod registry;
pub mod status;
pub mod store;

pub use client::SyncClient;
pub use events::{EventBus, SyncEvent};
pub use gateway::MutationGateway;
pub use normalize::{normalize_document, FieldKind, Schema};
pub use registry::SubscriptionRegistry;
pub use status::{CollectionStatus, LoadStatus, StatusTracker};
pub use store::{CollectionStore, Snapshot};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::remote::{Query, RemoteError};

/// Identifier of a synchronized collection (the backend collection name)
pub type CollectionKey = String;

/// Backend-assigned document identifier
pub type EntityId = String;

/// Registered collection specs, shared by the client and the gateway
pub(crate) type SpecTable = Arc<DashMap<CollectionKey, Arc<CollectionSpec>>>;

/// A normalized record as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Decode into a typed record; the id is exposed as the `id` field
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(object))
    }
}

/// Per-collection configuration: normalization schema, default live query
/// and the write-time stamping rules.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub key: CollectionKey,
    pub schema: Schema,
    /// Query used by a plain `subscribe`
    pub query: Query,
    /// Field stamped with the current time on create
    pub created_field: Option<String>,
    /// Field stamped with the current time on update
    pub updated_field: Option<String>,
}

impl CollectionSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            schema: Schema::default(),
            query: Query::all(),
            created_field: None,
            updated_field: None,
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_created_field(mut self, field: impl Into<String>) -> Self {
        self.created_field = Some(field.into());
        self
    }

    pub fn with_updated_field(mut self, field: impl Into<String>) -> Self {
        self.updated_field = Some(field.into());
        self
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur on the read side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncError {
    /// No spec registered under this key
    UnknownCollection(CollectionKey),
    /// The backend refused the live query
    Subscription(String),
    /// One-shot read failed
    Query(String),
    /// No previous subscription to retry
    NothingToRetry(CollectionKey),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::UnknownCollection(key) => write!(f, "Unknown collection: {}", key),
            SyncError::Subscription(msg) => write!(f, "Subscription error: {}", msg),
            SyncError::Query(msg) => write!(f, "Query error: {}", msg),
            SyncError::NothingToRetry(key) => write!(f, "No subscription to retry: {}", key),
        }
    }
}

impl std::error::Error for SyncError {}

/// Result type for mutations
pub type MutationResult<T> = Result<T, MutationError>;

/// Failed outcome of a create/update/remove.
///
/// The display string is the message shown to the user.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("{0}")]
    Rejected(#[from] RemoteError),

    #[error("Invalid mutation: {0}")]
    Invalid(String),

    #[error("{0}")]
    NotFound(String),
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Capacity of the change notification channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { event_capacity: 256 }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::UnknownCollection("resenas".to_string());
        assert_eq!(err.to_string(), "Unknown collection: resenas");
    }

    #[test]
    fn test_mutation_error_message_is_backend_message() {
        let err: MutationError = RemoteError::not_found("blogs", "b9").into();
        assert_eq!(err.to_string(), "Document not found: blogs/b9");
        assert_eq!(MutationError::NotFound("video not found".into()).to_string(), "video not found");
    }

    #[test]
    fn test_entity_serializes_flat() {
        let entity: Entity = serde_json::from_value(json!({"id": "p1", "nombre": "Crema"})).unwrap();
        assert_eq!(entity.id, "p1");
        assert_eq!(entity.get_str("nombre"), Some("Crema"));
        assert_eq!(serde_json::to_value(&entity).unwrap(), json!({"id": "p1", "nombre": "Crema"}));
    }

    #[test]
    fn test_entity_decode() {
        #[derive(Deserialize)]
        struct Named {
            id: String,
            nombre: String,
        }

        let mut fields = Map::new();
        fields.insert("nombre".into(), json!("Gel"));
        let named: Named = Entity::new("p2", fields).decode().unwrap();
        assert_eq!(named.id, "p2");
        assert_eq!(named.nombre, "Gel");
    }

    #[test]
    fn test_sync_config_default() {
        assert_eq!(SyncConfig::default().event_capacity, 256);
        assert_eq!(SyncConfig::new().with_event_capacity(0).event_capacity, 1);
    }
}
