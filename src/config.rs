//! Service configuration from environment variables.

use thiserror::Error;

use crate::auth::SessionConfig;
use crate::storage::StorageConfig;
use crate::sync::SyncConfig;
use crate::upload::UploadConfig;

/// Errors that can occur while reading configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Missing required variable: {0}")]
    Missing(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Everything the service binary needs to start
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
    /// Uploads are disabled when unset
    pub upload: Option<UploadConfig>,
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or(&lookup, "PORT", 5000u16)?;

        let mut storage = StorageConfig::default();
        if let Some(path) = lookup("STORAGE_PATH") {
            storage.path = path;
        }
        storage.flush_interval_ms = parse_or(&lookup, "STORAGE_FLUSH_MS", storage.flush_interval_ms)?;

        let sync = SyncConfig::new()
            .with_event_capacity(parse_or(&lookup, "SYNC_EVENT_CAPACITY", SyncConfig::default().event_capacity)?);

        let secret = lookup("SESSION_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Missing("SESSION_SECRET".to_string()))?;
        let mut session = SessionConfig::new(secret);
        if lookup("SESSION_TTL_SECONDS").is_some() {
            session = session.with_ttl(parse_or(&lookup, "SESSION_TTL_SECONDS", 0u64)?);
        }

        let upload = match (lookup("UPLOAD_URL"), lookup("UPLOAD_PRESET")) {
            (Some(url), Some(preset)) => Some(UploadConfig::new(url, preset)),
            _ => None,
        };

        Ok(Self {
            port,
            storage,
            sync,
            session,
            upload,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> ConfigResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(env(&[("SESSION_SECRET", "s3cret")])).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.storage.path, "./data/storefront.sled");
        assert_eq!(config.sync.event_capacity, 256);
        assert!(config.upload.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(env(&[
            ("SESSION_SECRET", "s3cret"),
            ("PORT", "8080"),
            ("STORAGE_PATH", "/tmp/store.sled"),
            ("SYNC_EVENT_CAPACITY", "16"),
            ("SESSION_TTL_SECONDS", "60"),
            ("UPLOAD_URL", "https://upload"),
            ("UPLOAD_PRESET", "preset"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.storage.path, "/tmp/store.sled");
        assert_eq!(config.sync.event_capacity, 16);
        assert_eq!(config.session.token_ttl_seconds, 60);
        assert_eq!(config.upload.unwrap().preset, "preset");
    }

    #[test]
    fn test_invalid_and_missing_values() {
        let err = AppConfig::from_lookup(env(&[("SESSION_SECRET", "x"), ("PORT", "http")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "PORT".into(),
                value: "http".into()
            }
        );

        let err = AppConfig::from_lookup(env(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SESSION_SECRET".into()));
    }
}
