//! # Records
//!
//! A [`Record`] is one business entity instance exactly as the upstream API
//! returned it: an opaque JSON object. The engine only ever looks at two
//! fields directly, `id` and `updated_at`; everything else is reached
//! through the column mapping of an [`EntityType`](crate::entity::EntityType).
//!
//! ## Identity and Freshness
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  {                                                                      │
//! │    "id": 1042,                 ◄── primary key, non-negative integer   │
//! │    "updated_at": "2024-03-01T10:15:00-05:00",                          │
//! │                                ◄── freshness, absent/null = UNIX 0     │
//! │    "customer": { "id": 7 },    ◄── reached via dotted path customer.id │
//! │    "comments": [ {...}, ... ]  ◄── nested child records                │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::transform;

/// Primary key of a mirrored record.
pub type RecordId = i64;

// =============================================================================
// Record
// =============================================================================

/// One upstream record, kept as the raw JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wraps an already-parsed JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Record(fields)
    }

    /// Converts an arbitrary JSON value, failing if it is not an object.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(fields) => Ok(Record(fields)),
            other => Err(CoreError::NotAnObject(type_name(&other).to_string())),
        }
    }

    /// Returns the record's primary key.
    ///
    /// ## Rules
    /// - Missing or `null` → [`CoreError::MissingId`]
    /// - Floats, strings, negative numbers → [`CoreError::InvalidId`]
    pub fn id(&self) -> CoreResult<RecordId> {
        match self.0.get("id") {
            None | Some(Value::Null) => Err(CoreError::MissingId),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(id) if id >= 0 => Ok(id),
                _ => Err(CoreError::InvalidId(n.to_string())),
            },
            Some(other) => Err(CoreError::InvalidId(other.to_string())),
        }
    }

    /// Returns `updated_at` as a UNIX timestamp.
    ///
    /// Absent, null or unparseable values count as "never updated" (0).
    pub fn updated_at(&self) -> i64 {
        self.0
            .get("updated_at")
            .and_then(transform::parse_timestamp_value)
            .map(|ts| ts.timestamp())
            .unwrap_or(0)
    }

    /// Looks up a field by dotted path (`customer.id`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Sets a top-level field, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Returns the nested child array stored under `field`.
    ///
    /// Missing or non-array values yield an empty slice.
    pub fn children(&self, field: &str) -> &[Value] {
        self.0
            .get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the underlying JSON object.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// SHA-256 of the record's canonical JSON (keys sorted at every level).
    ///
    /// Used as the change signal for entities without a trustworthy
    /// `updated_at`. Two records that differ only in key order hash equal.
    pub fn content_digest(&self) -> String {
        let canonical = canonicalize(&Value::Object(self.0.clone()));
        // Serializing a Value cannot fail: all map keys are strings.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Record(fields)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_id_rules() {
        assert_eq!(record(json!({"id": 42})).id().unwrap(), 42);
        assert_eq!(record(json!({"id": 0})).id().unwrap(), 0);
        assert!(matches!(record(json!({})).id(), Err(CoreError::MissingId)));
        assert!(matches!(
            record(json!({"id": null})).id(),
            Err(CoreError::MissingId)
        ));
        assert!(matches!(
            record(json!({"id": -3})).id(),
            Err(CoreError::InvalidId(_))
        ));
        assert!(matches!(
            record(json!({"id": 1.5})).id(),
            Err(CoreError::InvalidId(_))
        ));
        assert!(matches!(
            record(json!({"id": "12"})).id(),
            Err(CoreError::InvalidId(_))
        ));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(matches!(
            Record::from_value(json!([1, 2])),
            Err(CoreError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_updated_at_defaults_to_zero() {
        assert_eq!(record(json!({"id": 1})).updated_at(), 0);
        assert_eq!(record(json!({"id": 1, "updated_at": null})).updated_at(), 0);
        assert_eq!(
            record(json!({"id": 1, "updated_at": "not a date"})).updated_at(),
            0
        );
        assert_eq!(
            record(json!({"id": 1, "updated_at": "1970-01-01T00:01:40Z"})).updated_at(),
            100
        );
    }

    #[test]
    fn test_dotted_path_lookup() {
        let r = record(json!({"id": 1, "customer": {"id": 7, "name": "Ada"}}));
        assert_eq!(r.get("customer.id"), Some(&json!(7)));
        assert_eq!(r.get("customer.missing"), None);
        assert_eq!(r.get("id.nested"), None);
    }

    #[test]
    fn test_children() {
        let r = record(json!({"id": 1, "comments": [{"id": 10}, {"id": 11}], "tags": "x"}));
        assert_eq!(r.children("comments").len(), 2);
        assert!(r.children("tags").is_empty());
        assert!(r.children("missing").is_empty());
    }

    #[test]
    fn test_content_digest_ignores_key_order() {
        let a = record(json!({"id": 1, "name": "Cable", "meta": {"b": 1, "a": 2}}));
        let b = record(json!({"meta": {"a": 2, "b": 1}, "name": "Cable", "id": 1}));
        let c = record(json!({"id": 1, "name": "Cable 2m", "meta": {"b": 1, "a": 2}}));

        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.content_digest(), c.content_digest());
        assert_eq!(a.content_digest().len(), 64);
    }
}
