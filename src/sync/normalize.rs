//! Schema-driven value normalization.
//!
//! A [`Schema`] declares which fields of a collection are timestamps, plain
//! lists, nested records or ordered sequences of sub-records. Normalization
//! converts declared timestamps to ISO-8601 strings, walks declared
//! sub-records with their own schema, fills absent list fields with `[]`, and
//! passes everything else through as plain JSON. It never fails.

use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use super::Entity;
use crate::remote::{BackendValue, Fields, RawDocument, Timestamp};

/// How a declared field is normalized
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Backend timestamp, rendered as an ISO-8601 string
    Timestamp,
    /// List of plain values, `[]` when absent
    List,
    /// Ordered sequence of sub-records, `[]` when absent
    Records(Schema),
    /// Single nested record
    Record(Schema),
}

/// Field declarations of one record type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp(self, field: impl Into<String>) -> Self {
        self.field(field, FieldKind::Timestamp)
    }

    pub fn list(self, field: impl Into<String>) -> Self {
        self.field(field, FieldKind::List)
    }

    pub fn records(self, field: impl Into<String>, schema: Schema) -> Self {
        self.field(field, FieldKind::Records(schema))
    }

    pub fn record(self, field: impl Into<String>, schema: Schema) -> Self {
        self.field(field, FieldKind::Record(schema))
    }

    pub fn field(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), kind);
        self
    }

    pub fn kind(&self, field: &str) -> Option<&FieldKind> {
        self.fields.get(field)
    }

    /// Fields that default to an empty list
    pub fn list_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|(name, kind)| match kind {
            FieldKind::List | FieldKind::Records(_) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Render a backend timestamp the way the client stores it:
/// millisecond precision, UTC, `Z` suffix.
pub fn timestamp_to_iso(ts: &Timestamp) -> Option<String> {
    ts.to_datetime()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Normalize one backend document into a store entity
pub fn normalize_document(doc: RawDocument, schema: &Schema) -> Entity {
    Entity {
        id: doc.id,
        fields: normalize_fields(doc.fields, schema),
    }
}

/// Normalize a field map with `schema`
pub fn normalize_fields(fields: Fields, schema: &Schema) -> Map<String, Value> {
    let mut out: Map<String, Value> = fields
        .into_iter()
        .map(|(name, value)| {
            let normalized = normalize_value(value, schema.kind(&name));
            (name, normalized)
        })
        .collect();

    for name in schema.list_fields() {
        match out.get(name) {
            Some(Value::Null) | None => {
                out.insert(name.to_string(), Value::Array(Vec::new()));
            }
            Some(_) => {}
        }
    }

    out
}

fn normalize_value(value: BackendValue, kind: Option<&FieldKind>) -> Value {
    match (kind, value) {
        (Some(FieldKind::Timestamp), BackendValue::Timestamp(ts)) => match timestamp_to_iso(&ts) {
            Some(iso) => Value::String(iso),
            None => plain(BackendValue::Timestamp(ts)),
        },
        (Some(FieldKind::Records(schema)), BackendValue::Array(items)) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    BackendValue::Map(fields) => Value::Object(normalize_fields(fields, schema)),
                    other => plain(other),
                })
                .collect(),
        ),
        (Some(FieldKind::Record(schema)), BackendValue::Map(fields)) => {
            Value::Object(normalize_fields(fields, schema))
        }
        (_, other) => plain(other),
    }
}

/// Shape-preserving conversion for undeclared or unexpected values
fn plain(value: BackendValue) -> Value {
    match value {
        BackendValue::Null => Value::Null,
        BackendValue::Bool(b) => Value::Bool(b),
        BackendValue::Integer(i) => Value::Number(i.into()),
        BackendValue::Double(d) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
        BackendValue::String(s) => Value::String(s),
        BackendValue::Timestamp(ts) => {
            let mut map = Map::new();
            map.insert("seconds".to_string(), Value::Number(ts.seconds.into()));
            map.insert("nanos".to_string(), Value::Number(ts.nanos.into()));
            Value::Object(map)
        }
        BackendValue::Array(items) => Value::Array(items.into_iter().map(plain).collect()),
        BackendValue::Map(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, plain(v)))
                .collect(),
        ),
    }
}
