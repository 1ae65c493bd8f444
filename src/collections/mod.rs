//! Entity collections of the storefront.
//!
//! Each collection provides its [`CollectionSpec`](crate::sync::CollectionSpec),
//! a typed record decoded from normalized entities, and pure derived views.
//! Views are recomputed from `get_all` on every call and never write back.

pub mod blog;
pub mod catalog;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::remote::{fields_from_json, Fields};
use crate::sync::{Entity, MutationError, MutationResult, SyncClient};

/// Register every storefront collection with `client`
pub fn register_all(client: &SyncClient) {
    client.register(catalog::spec());
    client.register(blog::spec());
}

/// Subscribe every storefront collection with its default query.
///
/// A refused subscription is recorded in the status tracker and does not
/// prevent the others from starting.
pub fn subscribe_all(client: &SyncClient) -> Vec<(String, crate::sync::SyncError)> {
    [catalog::PRODUCTS, blog::BLOGS]
        .into_iter()
        .filter_map(|key| client.subscribe(key).err().map(|e| (key.to_string(), e)))
        .collect()
}

/// Decode every entity that fits `T`, skipping malformed records
pub(crate) fn decode_all<T: serde::de::DeserializeOwned>(entities: &[Entity]) -> Vec<T> {
    entities
        .iter()
        .filter_map(|entity| match entity.decode() {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!("Skipping malformed entity {}: {}", entity.id, e);
                None
            }
        })
        .collect()
}

/// Convert a JSON object from a form or request body into backend fields
pub fn fields_from_body(body: Value) -> MutationResult<Fields> {
    fields_from_json(body)
        .ok_or_else(|| MutationError::Invalid("expected a JSON object".to_string()))
}

/// Number that may be stored as a JSON number or a numeric string
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

pub(crate) fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_f64(deserializer)? as i64)
}

/// List of strings that may be stored as an array or a comma separated string
pub(crate) fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(s) => s
            .split([',', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    })
}

/// Nested records; anything other than an array reads as empty and
/// entries that do not fit `T` are dropped
pub(crate) fn lenient_records<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "lenient_f64")]
        price: f64,
        #[serde(default, deserialize_with = "lenient_strings")]
        tags: Vec<String>,
    }

    #[test]
    fn test_lenient_numbers_and_lists() {
        let sample: Sample = serde_json::from_value(json!({"price": "12.5", "tags": "a, b,,c"})).unwrap();
        assert_eq!(sample.price, 12.5);
        assert_eq!(sample.tags, vec!["a", "b", "c"]);

        let sample: Sample = serde_json::from_value(json!({"price": 3, "tags": ["x", null]})).unwrap();
        assert_eq!(sample.price, 3.0);
        assert_eq!(sample.tags, vec!["x"]);

        let sample: Sample = serde_json::from_value(json!({"price": null})).unwrap();
        assert_eq!(sample.price, 0.0);
        assert!(sample.tags.is_empty());
    }

    #[test]
    fn test_fields_from_body() {
        assert!(fields_from_body(json!({"nombre": "Crema"})).is_ok());
        assert!(matches!(
            fields_from_body(json!([1, 2])),
            Err(MutationError::Invalid(_))
        ));
    }

    #[test]
    fn test_register_and_subscribe_all() {
        let backend = Arc::new(MemoryBackend::new());
        let client = SyncClient::new(backend.clone());
        register_all(&client);

        assert!(subscribe_all(&client).is_empty());
        assert!(client.is_subscribed(catalog::PRODUCTS));
        assert!(client.is_subscribed(blog::BLOGS));
    }
}
