//! Persistent remote collection service on top of Sled.
//!
//! The service binary uses this backend as its document database. Documents
//! are stored bincode-encoded, one sled tree for documents and one for
//! per-collection metadata, and live queries are served through the same
//! listener hub as the in-memory backend.

mod sled_store;

pub use sled_store::{SledCollections, StorageError, StorageResult};

use serde::{Deserialize, Serialize};

/// Metadata stored alongside each collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Collection name
    pub collection: String,
    /// Unix timestamp of the first write
    pub created_at: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
    /// Number of stored documents
    pub document_count: u64,
    /// Number of acknowledged writes
    pub write_count: u64,
}

impl CollectionMetadata {
    pub fn new(collection: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            collection: collection.into(),
            created_at: now,
            updated_at: now,
            document_count: 0,
            write_count: 0,
        }
    }

    /// Record one write and the resulting document count
    pub fn record_write(&mut self, document_count: u64) {
        self.updated_at = chrono::Utc::now().timestamp();
        self.document_count = document_count;
        self.write_count += 1;
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = flush on every write)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/storefront.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, millis: u64) -> Self {
        self.flush_interval_ms = millis;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_record_write() {
        let mut meta = CollectionMetadata::new("blogs");
        meta.record_write(3);
        meta.record_write(2);

        assert_eq!(meta.collection, "blogs");
        assert_eq!(meta.document_count, 2);
        assert_eq!(meta.write_count, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 500);

        let config = StorageConfig::new("/tmp/x.sled").with_flush_interval(0);
        assert_eq!(config.path, "/tmp/x.sled");
        assert_eq!(config.flush_interval_ms, 0);
    }
}
