//! # Entity Descriptors
//!
//! An [`EntityType`] tells the generic engine everything it needs to know
//! about one upstream collection. The engine itself never mentions tickets,
//! invoices or any other concrete entity.
//!
//! ## Descriptor Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EntityType "tickets"                                                   │
//! │  ├── endpoint        GET {base}/tickets?page=N                          │
//! │  ├── collection      response["tickets"]                                │
//! │  ├── table           tickets            (live rows)                     │
//! │  ├── tombstone       deleted_tickets    (archived rows, same columns)   │
//! │  ├── columns         [ColumnSpec] remote path → local column + kind     │
//! │  ├── strategy        SinceFilter | BackwardScan | ForwardScan | ...     │
//! │  ├── detection       UpdatedAt | ContentHash                            │
//! │  ├── supports_full   may this entity feed the deletion detector?        │
//! │  ├── paged           false: one response, no `page` or `meta`           │
//! │  ├── lookback        default incremental window in days                 │
//! │  └── children        [ChildSpec] e.g. comments → comments.ticket_id     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::Record;
use crate::transform::{self, SqlValue};

/// Column holding the content digest of hash-detected entities.
pub const CONTENT_HASH_COLUMN: &str = "content_hash";

/// Column every descriptor needs for `updated_at` based detection.
pub const UPDATED_AT_COLUMN: &str = "updated_at";

// =============================================================================
// Column Kind
// =============================================================================

/// Storage kind of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Boolean,
    /// Stored as `YYYY-MM-DD HH:MM:SS` UTC text.
    Timestamp,
    /// Stored as `YYYY-MM-DD` text.
    Date,
    /// Nested structure, stored as encoded JSON text.
    Json,
}

impl ColumnKind {
    /// SQLite column type used when creating tables.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text | ColumnKind::Timestamp | ColumnKind::Date | ColumnKind::Json => {
                "TEXT"
            }
        }
    }
}

// =============================================================================
// Column Spec
// =============================================================================

/// Where a column's value comes from.
#[derive(Debug, Clone)]
pub enum ColumnSource {
    /// Dotted path into the record (`customer.id`).
    Field(String),
    /// Computed from the whole record.
    Derived(fn(&Record) -> SqlValue),
}

/// One remote field → local column mapping.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub source: ColumnSource,
    pub default: Option<SqlValue>,
}

impl ColumnSpec {
    /// Maps the top-level field of the same name.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let name = name.into();
        Self {
            source: ColumnSource::Field(name.clone()),
            name,
            kind,
            default: None,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub fn real(name: &str) -> Self {
        Self::new(name, ColumnKind::Real)
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ColumnKind::Boolean)
    }

    pub fn timestamp(name: &str) -> Self {
        Self::new(name, ColumnKind::Timestamp)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnKind::Date)
    }

    pub fn json(name: &str) -> Self {
        Self::new(name, ColumnKind::Json)
    }

    /// A column computed from the record rather than read from one field.
    pub fn derived(name: &str, kind: ColumnKind, compute: fn(&Record) -> SqlValue) -> Self {
        Self {
            name: name.to_string(),
            kind,
            source: ColumnSource::Derived(compute),
            default: None,
        }
    }

    /// Reads the value from a different (possibly nested) field path.
    pub fn from_path(mut self, path: &str) -> Self {
        self.source = ColumnSource::Field(path.to_string());
        self
    }

    /// Value written when the field is missing or malformed.
    pub fn with_default(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Produces the value to store for `record`.
    pub fn extract(&self, record: &Record) -> SqlValue {
        let value = match &self.source {
            ColumnSource::Field(path) => transform::coerce(self.kind, record.get(path)),
            ColumnSource::Derived(compute) => Some(compute(record)).filter(|v| !v.is_null()),
        };
        value
            .or_else(|| self.default.clone())
            .unwrap_or(SqlValue::Null)
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// How an INCREMENTAL run decides which pages to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalStrategy {
    /// Server-side `since_updated_at` filter; walk filtered pages in order.
    SinceFilter,
    /// Oldest-first collection: read page 1 for `total_pages`, walk from
    /// the last page backward, stop after the first page whose oldest
    /// record predates the boundary.
    BackwardScan,
    /// Newest-first collection: walk forward, stop after the first page
    /// holding a record older than the boundary.
    ForwardScan,
    /// No freshness signal: walk every page.
    Exhaustive,
}

impl fmt::Display for IncrementalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IncrementalStrategy::SinceFilter => "since_filter",
            IncrementalStrategy::BackwardScan => "backward_scan",
            IncrementalStrategy::ForwardScan => "forward_scan",
            IncrementalStrategy::Exhaustive => "exhaustive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for IncrementalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "since_filter" => Ok(IncrementalStrategy::SinceFilter),
            "backward_scan" => Ok(IncrementalStrategy::BackwardScan),
            "forward_scan" => Ok(IncrementalStrategy::ForwardScan),
            "exhaustive" => Ok(IncrementalStrategy::Exhaustive),
            _ => Err(format!("Unknown incremental strategy: {}", s)),
        }
    }
}

/// How the reconciler decides that a stored row is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    /// Compare `updated_at` against the stored value and the cursor.
    UpdatedAt,
    /// Compare a SHA-256 digest of the record content.
    ContentHash,
    /// Rows are written once and never rewritten.
    InsertOnly,
}

// =============================================================================
// Child Spec
// =============================================================================

/// Nested child records carried inside each parent record.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Parent field holding the child array.
    pub field: String,
    /// Child column that references the parent's id.
    pub parent_column: String,
    /// Descriptor of the child table.
    pub entity: EntityType,
}

impl ChildSpec {
    pub fn new(field: &str, parent_column: &str, entity: EntityType) -> Self {
        Self {
            field: field.to_string(),
            parent_column: parent_column.to_string(),
            entity,
        }
    }
}

// =============================================================================
// Entity Type
// =============================================================================

/// Descriptor of one mirrored collection.
///
/// ## Example
/// ```rust
/// use mirror_core::entity::{ColumnSpec, EntityType, IncrementalStrategy};
///
/// let widgets = EntityType::new("widgets")
///     .column(ColumnSpec::text("name"))
///     .column(ColumnSpec::timestamp("updated_at"))
///     .strategy(IncrementalStrategy::BackwardScan);
///
/// assert_eq!(widgets.table, "widgets");
/// assert_eq!(widgets.tombstone_table.as_deref(), Some("deleted_widgets"));
/// ```
#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    /// Path segment appended to the API base URL.
    pub endpoint: String,
    /// Response field holding the record array.
    pub collection: String,
    pub table: String,
    /// `None` opts the entity out of deletion detection.
    pub tombstone_table: Option<String>,
    pub columns: Vec<ColumnSpec>,
    pub strategy: IncrementalStrategy,
    pub change_detection: ChangeDetection,
    pub supports_full: bool,
    pub default_lookback_days: Option<u32>,
    pub children: Vec<ChildSpec>,
    /// `false` for endpoints that answer with the whole collection at once.
    pub paged: bool,
    /// Field names for collections whose items are arrays (`[id, name]`)
    /// rather than objects.
    pub positional_fields: Option<Vec<String>>,
}

impl EntityType {
    /// Creates a descriptor whose endpoint, collection and table all equal
    /// `name`, archived into `deleted_{name}`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: name.to_string(),
            collection: name.to_string(),
            table: name.to_string(),
            tombstone_table: Some(format!("deleted_{}", name)),
            columns: Vec::new(),
            strategy: IncrementalStrategy::Exhaustive,
            change_detection: ChangeDetection::UpdatedAt,
            supports_full: true,
            default_lookback_days: None,
            children: Vec::new(),
            paged: true,
            positional_fields: None,
        }
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn collection(mut self, collection: &str) -> Self {
        self.collection = collection.to_string();
        self
    }

    /// Sets the live table; the tombstone follows as `deleted_{table}`.
    pub fn table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        if self.tombstone_table.is_some() {
            self.tombstone_table = Some(format!("deleted_{}", table));
        }
        self
    }

    pub fn without_tombstone(mut self) -> Self {
        self.tombstone_table = None;
        self
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = ColumnSpec>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn strategy(mut self, strategy: IncrementalStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn change_detection(mut self, detection: ChangeDetection) -> Self {
        self.change_detection = detection;
        self
    }

    pub fn supports_full(mut self, supported: bool) -> Self {
        self.supports_full = supported;
        self
    }

    pub fn default_lookback_days(mut self, days: u32) -> Self {
        self.default_lookback_days = Some(days);
        self
    }

    pub fn child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    /// The endpoint returns everything in one response without `meta`.
    pub fn unpaged(mut self) -> Self {
        self.paged = false;
        self
    }

    /// Items arrive as arrays; element `i` is named `fields[i]`.
    pub fn positional(mut self, fields: &[&str]) -> Self {
        self.positional_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Turns a positional item into an object. Objects, and every item of
    /// an entity without positional fields, pass through unchanged.
    pub fn shape(&self, item: Value) -> Value {
        match (&self.positional_fields, item) {
            (Some(fields), Value::Array(values)) => {
                let object: Map<String, Value> = fields.iter().cloned().zip(values).collect();
                Value::Object(object)
            }
            (_, item) => item,
        }
    }

    /// All stored columns in table order, excluding `id`.
    ///
    /// Hash-detected entities get the digest column appended.
    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        if self.uses_content_hash() {
            names.push(CONTENT_HASH_COLUMN);
        }
        names
    }

    pub fn uses_content_hash(&self) -> bool {
        self.change_detection == ChangeDetection::ContentHash
    }

    /// True when removed upstream records should be archived.
    pub fn tracks_deletions(&self) -> bool {
        self.tombstone_table.is_some()
    }

    pub fn has_updated_at(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.name == UPDATED_AT_COLUMN && c.kind == ColumnKind::Timestamp)
    }

    /// Maps a record to its column values, in [`column_names`](Self::column_names) order.
    pub fn row_values(&self, record: &Record) -> Vec<SqlValue> {
        let mut values: Vec<SqlValue> = self.columns.iter().map(|c| c.extract(record)).collect();
        if self.uses_content_hash() {
            values.push(SqlValue::Text(record.content_digest()));
        }
        values
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
