//! Backend-native value types.
//!
//! These mirror what the document database hands back: scalar values, its own
//! timestamp type, arrays and nested maps. Nothing here is client-ready; the
//! sync layer normalizes these into plain JSON before they reach the store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Field map of a document
pub type Fields = BTreeMap<String, BackendValue>;

/// The backend's native timestamp representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub seconds: i64,
    /// Sub-second nanoseconds (0..1_000_000_000)
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            seconds: millis.div_euclid(1000),
            nanos: (millis.rem_euclid(1000) as u32) * 1_000_000,
        }
    }

    /// Convert to a chrono instant, `None` when out of chrono's range
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.seconds, self.nanos).single()
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1000 + i64::from(self.nanos / 1_000_000)
    }
}

/// A single field value as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendValue {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(Timestamp),
    Array(Vec<BackendValue>),
    Map(Fields),
}

impl BackendValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BackendValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BackendValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[BackendValue]> {
        match self {
            BackendValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            BackendValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Build a backend value from client JSON.
    ///
    /// Integral numbers become `Integer`, everything else numeric becomes
    /// `Double`. JSON has no timestamp type, so strings stay strings.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => BackendValue::Null,
            Value::Bool(b) => BackendValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => BackendValue::Integer(i),
                None => BackendValue::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => BackendValue::String(s),
            Value::Array(items) => {
                BackendValue::Array(items.into_iter().map(BackendValue::from_json).collect())
            }
            Value::Object(map) => BackendValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, BackendValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Type rank used to order values of different kinds
    fn rank(&self) -> u8 {
        match self {
            BackendValue::Null => 0,
            BackendValue::Bool(_) => 1,
            BackendValue::Integer(_) | BackendValue::Double(_) => 2,
            BackendValue::Timestamp(_) => 3,
            BackendValue::String(_) => 4,
            BackendValue::Array(_) => 5,
            BackendValue::Map(_) => 6,
        }
    }

    /// Total order over backend values, used for `order_by` queries.
    ///
    /// Values of different kinds order by kind; numbers compare across
    /// integer/double, NaN sorts as equal.
    pub fn total_cmp(&self, other: &BackendValue) -> Ordering {
        use BackendValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Double(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Double(a), Integer(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Double(a), Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Map(a), Map(b)) => a.len().cmp(&b.len()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<&str> for BackendValue {
    fn from(value: &str) -> Self {
        BackendValue::String(value.to_string())
    }
}

impl From<String> for BackendValue {
    fn from(value: String) -> Self {
        BackendValue::String(value)
    }
}

impl From<i64> for BackendValue {
    fn from(value: i64) -> Self {
        BackendValue::Integer(value)
    }
}

impl From<f64> for BackendValue {
    fn from(value: f64) -> Self {
        BackendValue::Double(value)
    }
}

impl From<bool> for BackendValue {
    fn from(value: bool) -> Self {
        BackendValue::Bool(value)
    }
}

impl From<Timestamp> for BackendValue {
    fn from(value: Timestamp) -> Self {
        BackendValue::Timestamp(value)
    }
}

impl From<Fields> for BackendValue {
    fn from(value: Fields) -> Self {
        BackendValue::Map(value)
    }
}

impl<T: Into<BackendValue>> From<Vec<T>> for BackendValue {
    fn from(value: Vec<T>) -> Self {
        BackendValue::Array(value.into_iter().map(Into::into).collect())
    }
}

/// Convert a JSON object into a field map; anything else yields `None`
pub fn fields_from_json(value: serde_json::Value) -> Option<Fields> {
    match BackendValue::from_json(value) {
        BackendValue::Map(fields) => Some(fields),
        _ => None,
    }
}

/// A document as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    /// Backend-assigned identifier
    pub id: String,
    /// Raw field values
    pub fields: Fields,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&BackendValue> {
        self.fields.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_millis() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 123_000_000);
        assert_eq!(ts.to_millis(), 1_700_000_000_123);

        let before_epoch = Timestamp::from_millis(-1);
        assert_eq!(before_epoch.seconds, -1);
        assert_eq!(before_epoch.nanos, 999_000_000);
    }

    #[test]
    fn test_from_json() {
        let value = BackendValue::from_json(serde_json::json!({
            "nombre": "Crema",
            "precio": 12.5,
            "stock": 3,
            "uso": ["rostro", "manos"],
        }));

        let map = value.as_map().unwrap();
        assert_eq!(map["nombre"], BackendValue::from("Crema"));
        assert_eq!(map["precio"], BackendValue::Double(12.5));
        assert_eq!(map["stock"], BackendValue::Integer(3));
        assert_eq!(map["uso"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_fields_from_json_rejects_non_objects() {
        assert!(fields_from_json(serde_json::json!([1, 2])).is_none());
        assert!(fields_from_json(serde_json::json!({})).is_some());
    }

    #[test]
    fn test_total_cmp() {
        let a = BackendValue::Integer(2);
        let b = BackendValue::Double(2.5);
        assert_eq!(a.total_cmp(&b), Ordering::Less);

        let earlier = BackendValue::Timestamp(Timestamp::new(10, 0));
        let later = BackendValue::Timestamp(Timestamp::new(10, 5));
        assert_eq!(later.total_cmp(&earlier), Ordering::Greater);

        // Kinds order before values
        assert_eq!(BackendValue::Null.total_cmp(&BackendValue::from("x")), Ordering::Less);
    }
}
