//! # Field Transforms
//!
//! Conversions applied to a record field immediately before it is written:
//! timestamps are normalized to `YYYY-MM-DD HH:MM:SS` (UTC), nested
//! structures are JSON-encoded, and loosely typed API values (numbers sent
//! as strings, booleans sent as 0/1) are coerced to the column's kind.
//!
//! A value that cannot be coerced is treated as missing, so the column's
//! default (or NULL) is written instead of failing the whole record.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::ColumnKind;

/// Storage format for timestamp columns.
pub const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Storage format for date columns.
pub const DB_DATE_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// SqlValue
// =============================================================================

/// A column value ready to be bound into a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Boolean(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Parses the timestamp shapes the API produces.
///
/// Accepts RFC 3339 (`2024-03-01T10:15:00-05:00`), naive date-times
/// (`2024-03-01 10:15:00` or with a `T`, read as UTC) and bare dates
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, DB_DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// [`parse_timestamp`] for a JSON value; integers are read as UNIX seconds.
pub fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Formats a UNIX timestamp in the storage format.
pub fn format_unix(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format(DB_TIMESTAMP_FORMAT)
        .to_string()
}

/// Formats a UNIX timestamp as the `since_updated_at` query date.
pub fn format_since_date(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format(DB_DATE_FORMAT)
        .to_string()
}

// =============================================================================
// Column Coercion
// =============================================================================

/// Coerces a raw field value into `kind`.
///
/// Returns `None` for missing, null or malformed input.
pub fn coerce(kind: ColumnKind, value: Option<&Value>) -> Option<SqlValue> {
    let value = match value {
        None | Some(Value::Null) => return None,
        Some(v) => v,
    };

    match kind {
        ColumnKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(SqlValue::Integer),
            Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
            Value::String(s) => s.trim().parse().ok().map(SqlValue::Integer),
            _ => None,
        },
        ColumnKind::Real => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Real),
            Value::String(s) => s.trim().parse().ok().map(SqlValue::Real),
            _ => None,
        },
        ColumnKind::Boolean => match value {
            Value::Bool(b) => Some(SqlValue::Boolean(*b)),
            Value::Number(n) => n.as_i64().map(|i| SqlValue::Boolean(i != 0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(SqlValue::Boolean(true)),
                "false" | "0" | "no" => Some(SqlValue::Boolean(false)),
                _ => None,
            },
            _ => None,
        },
        ColumnKind::Text => match value {
            Value::String(s) => Some(SqlValue::Text(s.clone())),
            Value::Number(_) | Value::Bool(_) => Some(SqlValue::Text(value.to_string())),
            Value::Array(_) | Value::Object(_) => Some(SqlValue::Text(value.to_string())),
            Value::Null => None,
        },
        ColumnKind::Timestamp => parse_timestamp_value(value)
            .map(|ts| SqlValue::Text(ts.format(DB_TIMESTAMP_FORMAT).to_string())),
        ColumnKind::Date => parse_timestamp_value(value)
            .map(|ts| SqlValue::Text(ts.format(DB_DATE_FORMAT).to_string())),
        ColumnKind::Json => Some(SqlValue::Text(value.to_string())),
    }
}

// =============================================================================
// Derived Values
// =============================================================================

/// Reads a device count written as `(N)` in a ticket subject.
///
/// The first parenthesized run of digits wins; subjects without one
/// count as a single device.
pub fn extract_devices(subject: &str) -> i64 {
    let mut rest = subject;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let digits: &str = &after[..after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len())];
        if !digits.is_empty() && after[digits.len()..].starts_with(')') {
            if let Ok(n) = digits.parse() {
                return n;
            }
        }
        rest = after;
    }
    1
}

// =============================================================================
// Unit Tests
// =============================================================================
