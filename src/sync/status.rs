//! Per-collection load status and last error.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::CollectionKey;

/// Read state of a collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Succeeded,
    Failed,
}

/// Status entry surfaced to the UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub status: LoadStatus,
    pub last_error: Option<String>,
}

/// Status/error tracker, one entry per collection key
#[derive(Debug, Default)]
pub struct StatusTracker {
    entries: DashMap<CollectionKey, CollectionStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription started
    pub fn mark_loading(&self, key: &str) -> CollectionStatus {
        self.update(key, |entry| {
            entry.status = LoadStatus::Loading;
            entry.last_error = None;
        })
    }

    /// Snapshot applied
    pub fn mark_succeeded(&self, key: &str) -> CollectionStatus {
        self.update(key, |entry| {
            entry.status = LoadStatus::Succeeded;
            entry.last_error = None;
        })
    }

    /// Subscription failed
    pub fn mark_failed(&self, key: &str, message: impl Into<String>) -> CollectionStatus {
        let message = message.into();
        self.update(key, |entry| {
            entry.status = LoadStatus::Failed;
            entry.last_error = Some(message);
        })
    }

    pub fn clear_error(&self, key: &str) -> CollectionStatus {
        self.update(key, |entry| entry.last_error = None)
    }

    pub fn get(&self, key: &str) -> CollectionStatus {
        self.entries
            .get(key)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn status(&self, key: &str) -> LoadStatus {
        self.entries.get(key).map(|e| e.status).unwrap_or_default()
    }

    pub fn last_error(&self, key: &str) -> Option<String> {
        self.entries.get(key).and_then(|e| e.last_error.clone())
    }

    fn update(&self, key: &str, f: impl FnOnce(&mut CollectionStatus)) -> CollectionStatus {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        f(&mut entry);
        entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_is_idle() {
        let tracker = StatusTracker::new();
        assert_eq!(tracker.status("blogs"), LoadStatus::Idle);
        assert!(tracker.last_error("blogs").is_none());
    }

    #[test]
    fn test_lifecycle() {
        let tracker = StatusTracker::new();

        tracker.mark_loading("blogs");
        assert_eq!(tracker.status("blogs"), LoadStatus::Loading);

        tracker.mark_failed("blogs", "permission denied");
        assert_eq!(tracker.status("blogs"), LoadStatus::Failed);
        assert_eq!(tracker.last_error("blogs").as_deref(), Some("permission denied"));

        // A later snapshot recovers without passing through loading
        let entry = tracker.mark_succeeded("blogs");
        assert_eq!(entry.status, LoadStatus::Succeeded);
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_clear_error_keeps_status() {
        let tracker = StatusTracker::new();
        tracker.mark_failed("productos", "offline");

        let entry = tracker.clear_error("productos");
        assert_eq!(entry.status, LoadStatus::Failed);
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&LoadStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }
}
