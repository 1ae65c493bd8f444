//! Sled-based remote collection service.
//!
//! Key layout in the `documents` tree is `<collection>\0<id>`, so a prefix
//! scan returns one collection in id order. Values are bincode-encoded field
//! maps.

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::{CollectionMetadata, StorageConfig};
use crate::remote::{
    Fields, Listener, ListenerHandle, ListenerHub, Patch, Query, RawDocument, RemoteCollection,
    RemoteError, RemoteResult,
};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in key: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for RemoteError {
    fn from(err: StorageError) -> Self {
        RemoteError::Storage(err.to_string())
    }
}

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";

const KEY_SEPARATOR: u8 = 0;

fn document_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + id.len() + 1);
    key.extend_from_slice(collection.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut prefix = collection.as_bytes().to_vec();
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Sled-backed document collections with live queries
#[derive(Clone)]
pub struct SledCollections {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
    hub: Arc<ListenerHub>,
    /// Held across read-modify-write of a document
    writes: Arc<Mutex<()>>,
    config: StorageConfig,
}

impl SledCollections {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
            hub: Arc::new(ListenerHub::new()),
            writes: Arc::new(Mutex::new(())),
            config,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    pub fn hub(&self) -> &Arc<ListenerHub> {
        &self.hub
    }

    /// Load every document of a collection in id order.
    ///
    /// Documents that fail to decode are skipped with a warning.
    pub fn load_collection(&self, collection: &str) -> StorageResult<Vec<RawDocument>> {
        let prefix = collection_prefix(collection);
        let mut docs = Vec::new();
        for item in self.documents.scan_prefix(&prefix) {
            let (key, value) = item?;
            match decode_document(&key[prefix.len()..], &value) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!("Skipping document in {}: {}", collection, e),
            }
        }
        Ok(docs)
    }

    /// Load a single document
    pub fn load_document(&self, collection: &str, id: &str) -> StorageResult<Option<Fields>> {
        match self.documents.get(document_key(collection, id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a document, replacing any previous version
    pub fn save_document(&self, collection: &str, id: &str, fields: &Fields) -> StorageResult<()> {
        let bytes = bincode::serialize(fields)?;
        self.documents.insert(document_key(collection, id), bytes)?;
        self.touch_metadata(collection)?;
        self.flush_if_immediate()?;
        Ok(())
    }

    /// Remove a document, returning whether it existed
    pub fn delete_document(&self, collection: &str, id: &str) -> StorageResult<bool> {
        let existed = self.documents.remove(document_key(collection, id))?.is_some();
        if existed {
            self.touch_metadata(collection)?;
            self.flush_if_immediate()?;
        }
        Ok(existed)
    }

    /// Load collection metadata
    pub fn get_metadata(&self, collection: &str) -> StorageResult<Option<CollectionMetadata>> {
        match self.metadata.get(collection.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List metadata of every collection that has seen a write
    pub fn list_collections(&self) -> StorageResult<Vec<CollectionMetadata>> {
        let mut out = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn touch_metadata(&self, collection: &str) -> StorageResult<()> {
        let count = self.documents.scan_prefix(collection_prefix(collection)).count() as u64;
        let mut meta = self
            .get_metadata(collection)?
            .unwrap_or_else(|| CollectionMetadata::new(collection));
        meta.record_write(count);
        self.metadata
            .insert(collection.as_bytes(), bincode::serialize(&meta)?)?;
        Ok(())
    }

    fn flush_if_immediate(&self) -> StorageResult<()> {
        if self.config.flush_interval_ms == 0 {
            self.db.flush()?;
        }
        Ok(())
    }

    fn publish(&self, collection: &str) {
        self.hub
            .publish(collection, || Ok(self.load_collection(collection)?));
    }
}

fn decode_document(id: &[u8], value: &[u8]) -> StorageResult<RawDocument> {
    let id = std::str::from_utf8(id)
        .map_err(|_| StorageError::Corruption(String::from_utf8_lossy(id).into_owned()))?;
    let fields: Fields = bincode::deserialize(value)?;
    Ok(RawDocument::new(id, fields))
}

#[async_trait]
impl RemoteCollection for SledCollections {
    fn live_query(
        &self,
        collection: &str,
        query: &Query,
        listener: Listener,
    ) -> RemoteResult<ListenerHandle> {
        query.validate()?;
        self.hub
            .register(collection, query, listener, || Ok(self.load_collection(collection)?))
    }

    async fn insert(&self, collection: &str, fields: Fields) -> RemoteResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        {
            let _write = self.writes.lock();
            self.save_document(collection, &id, &fields)?;
        }
        debug!("Inserted {}/{}", collection, id);
        self.publish(collection);
        Ok(id)
    }

    async fn patch(&self, collection: &str, id: &str, patch: Patch) -> RemoteResult<()> {
        {
            let _write = self.writes.lock();
            let mut fields = self
                .load_document(collection, id)?
                .ok_or_else(|| RemoteError::not_found(collection, id))?;
            patch.apply_to(&mut fields);
            self.save_document(collection, id, &fields)?;
        }
        self.publish(collection);
        Ok(())
    }

    async fn erase(&self, collection: &str, id: &str) -> RemoteResult<()> {
        let existed = {
            let _write = self.writes.lock();
            self.delete_document(collection, id)?
        };
        if !existed {
            return Err(RemoteError::not_found(collection, id));
        }
        self.publish(collection);
        Ok(())
    }

    async fn query_once(&self, collection: &str, query: &Query) -> RemoteResult<Vec<RawDocument>> {
        query.validate()?;
        Ok(query.apply(self.load_collection(collection)?))
    }

    async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<RawDocument>> {
        Ok(self
            .load_document(collection, id)?
            .map(|fields| RawDocument::new(id, fields)))
    }
}

impl Drop for SledCollections {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
