//! Mutation gateway: the write path to the backend.
//!
//! Writes resolve on backend acknowledgement. The gateway never touches the
//! collection store; the change shows up once the next snapshot arrives
//! through the subscription registry. Failures go back to the caller only and
//! are not recorded in the status tracker.

use std::sync::Arc;
use tracing::{info, warn};

use super::{CollectionSpec, EntityId, MutationError, MutationResult, SpecTable};
use crate::remote::{BackendValue, Fields, Patch, RemoteCollection, Timestamp};

/// Issues create/update/remove requests for registered collections.
///
/// Collections without a registered spec are written as given.
pub struct MutationGateway {
    remote: Arc<dyn RemoteCollection>,
    specs: SpecTable,
}

impl MutationGateway {
    pub(crate) fn new(remote: Arc<dyn RemoteCollection>, specs: SpecTable) -> Self {
        Self { remote, specs }
    }

    /// Create a document and return its backend-assigned id
    pub async fn create(&self, key: &str, mut fields: Fields) -> MutationResult<EntityId> {
        fields.remove("id");
        if let Some(spec) = self.spec(key) {
            prepare_create(&spec, &mut fields, Timestamp::now());
        }

        let id = self
            .remote
            .insert(key, fields)
            .await
            .map_err(|e| rejected("create", key, e))?;
        info!("Created {}/{}", key, id);
        Ok(id)
    }

    /// Apply a partial update to an existing document
    pub async fn update(&self, key: &str, id: &str, mut patch: Patch) -> MutationResult<()> {
        validate_id(id)?;
        patch.remove("id");
        if let Some(spec) = self.spec(key) {
            if let Some(field) = &spec.created_field {
                patch.remove(field);
            }
            if let Some(field) = &spec.updated_field {
                patch = patch.set(field.clone(), Timestamp::now());
            }
        }
        if patch.is_empty() {
            return Err(MutationError::Invalid("no fields to update".to_string()));
        }

        self.remote
            .patch(key, id, patch)
            .await
            .map_err(|e| rejected("update", key, e))?;
        info!("Updated {}/{}", key, id);
        Ok(())
    }

    /// Write a patch exactly as given, without stamping.
    ///
    /// Used by collection-specific writes that manage their own fields,
    /// such as appending a comment.
    pub async fn apply(&self, key: &str, id: &str, patch: Patch) -> MutationResult<()> {
        validate_id(id)?;
        if patch.is_empty() {
            return Err(MutationError::Invalid("no fields to update".to_string()));
        }
        self.remote
            .patch(key, id, patch)
            .await
            .map_err(|e| rejected("update", key, e))?;
        info!("Patched {}/{}", key, id);
        Ok(())
    }

    /// Delete a document
    pub async fn remove(&self, key: &str, id: &str) -> MutationResult<()> {
        validate_id(id)?;
        self.remote
            .erase(key, id)
            .await
            .map_err(|e| rejected("remove", key, e))?;
        info!("Removed {}/{}", key, id);
        Ok(())
    }

    fn spec(&self, key: &str) -> Option<Arc<CollectionSpec>> {
        self.specs.get(key).map(|s| s.clone())
    }
}

/// Stamp creation time and initialize declared list fields
fn prepare_create(spec: &CollectionSpec, fields: &mut Fields, now: Timestamp) {
    if let Some(field) = &spec.created_field {
        fields
            .entry(field.clone())
            .or_insert(BackendValue::Timestamp(now));
    }
    for name in spec.schema.list_fields() {
        let missing = matches!(fields.get(name), None | Some(BackendValue::Null));
        if missing {
            fields.insert(name.to_string(), BackendValue::Array(Vec::new()));
        }
    }
}

pub(crate) fn validate_id(id: &str) -> MutationResult<()> {
    if id.trim().is_empty() {
        return Err(MutationError::Invalid("document id is required".to_string()));
    }
    Ok(())
}

fn rejected(op: &str, key: &str, err: crate::remote::RemoteError) -> MutationError {
    warn!("Failed to {} in {}: {}", op, key, err);
    MutationError::Rejected(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryBackend, RemoteError};
    use crate::sync::Schema;
    use dashmap::DashMap;
    use tokio_test::{assert_err, assert_ok};

    fn gateway(backend: Arc<MemoryBackend>) -> MutationGateway {
        let specs: SpecTable = Arc::new(DashMap::new());
        let spec = CollectionSpec::new("blogs")
            .with_schema(Schema::new().timestamp("createdAt").records("comments", Schema::new()))
            .with_created_field("createdAt")
            .with_updated_field("updatedAt");
        specs.insert("blogs".to_string(), Arc::new(spec));
        MutationGateway::new(backend, specs)
    }

    fn fields(title: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), title.into());
        fields
    }

    #[tokio::test]
    async fn test_create_stamps_and_initializes_lists() {
        let backend = Arc::new(MemoryBackend::new());
        let gateway = gateway(backend.clone());

        let mut input = fields("Hola");
        input.insert("id".into(), "client-chosen".into());
        let id = gateway.create("blogs", input).await.unwrap();

        let doc = backend.get("blogs", &id).await.unwrap().unwrap();
        assert_ne!(id, "client-chosen");
        assert!(doc.get("id").is_none());
        assert!(matches!(doc.get("createdAt"), Some(BackendValue::Timestamp(_))));
        assert_eq!(doc.get("comments"), Some(&BackendValue::Array(Vec::new())));
        assert!(doc.get("updatedAt").is_none());
    }

    #[tokio::test]
    async fn test_create_keeps_given_timestamp() {
        let backend = Arc::new(MemoryBackend::new());
        let gateway = gateway(backend.clone());

        let mut input = fields("Antiguo");
        input.insert("createdAt".into(), Timestamp::new(10, 0).into());
        let id = gateway.create("blogs", input).await.unwrap();

        let doc = backend.get("blogs", &id).await.unwrap().unwrap();
        assert_eq!(doc.get("createdAt"), Some(&BackendValue::Timestamp(Timestamp::new(10, 0))));
    }

    #[tokio::test]
    async fn test_update_stamps_updated_field() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("blogs", "b1", fields("Viejo"));
        let gateway = gateway(backend.clone());

        assert_ok!(
            gateway
                .update(
                    "blogs",
                    "b1",
                    Patch::new()
                        .set("title", "Nuevo")
                        .set("id", "x")
                        .set("createdAt", "2024-01-01T00:00:00.000Z"),
                )
                .await
        );

        let doc = backend.get("blogs", "b1").await.unwrap().unwrap();
        assert_eq!(doc.get("title"), Some(&BackendValue::from("Nuevo")));
        assert!(doc.get("createdAt").is_none());
        assert!(matches!(doc.get("updatedAt"), Some(BackendValue::Timestamp(_))));
        assert!(doc.get("id").is_none());
    }

    #[tokio::test]
    async fn test_unregistered_collection_written_as_given() {
        let backend = Arc::new(MemoryBackend::new());
        let gateway = gateway(backend.clone());

        let id = gateway.create("notas", fields("x")).await.unwrap();
        let doc = backend.get("notas", &id).await.unwrap().unwrap();
        assert_eq!(doc.fields.len(), 1);

        assert!(matches!(
            gateway.update("notas", &id, Patch::new()).await,
            Err(MutationError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_failures_are_returned_to_caller() {
        let backend = Arc::new(MemoryBackend::new());
        let gateway = gateway(backend.clone());

        let err = gateway.remove("blogs", "missing").await.unwrap_err();
        assert_eq!(err, MutationError::Rejected(RemoteError::not_found("blogs", "missing")));

        assert!(matches!(
            gateway.remove("blogs", "  ").await,
            Err(MutationError::Invalid(_))
        ));

        backend.fail_next_write(RemoteError::PermissionDenied("blogs".into()));
        let err = assert_err!(gateway.create("blogs", fields("x")).await);
        assert_eq!(err.to_string(), "Permission denied: blogs");
        assert_eq!(backend.document_count("blogs"), 0);
    }
}
