//! # Error Types
//!
//! Domain-specific error types for mirror-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  mirror-core errors (this file)                                        │
//! │  ├── CoreError        - Record / descriptor errors                     │
//! │  └── ValidationError  - Entity descriptor validation failures          │
//! │                                                                         │
//! │  mirror-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  mirror-sync errors (separate crate)                                   │
//! │  └── SyncError        - Fetch, retry and run failures                  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError/SyncError → CLI           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Record and descriptor errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record has no `id` field (or it is null).
    ///
    /// ## When This Occurs
    /// - Upstream returned a malformed element in the collection array
    /// - A nested child array contains a stub without an id
    ///
    /// Such records are rejected and counted, never silently dropped.
    #[error("Record has no id")]
    MissingId,

    /// The `id` field is present but is not a non-negative integer.
    #[error("Record id is not a non-negative integer: {0}")]
    InvalidId(String),

    /// A payload element is not a JSON object.
    #[error("Expected a JSON object for a record, got {0}")]
    NotAnObject(String),

    /// No entity with this name exists in the catalog.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Entity descriptor validation errors.
///
/// Table and column names end up interpolated into SQL, so every
/// descriptor is checked before any statement is built from it.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Identifier contains characters outside `[a-z0-9_]` or is empty.
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),

    /// The same column appears twice in a descriptor.
    #[error("Entity {entity} declares column '{column}' more than once")]
    DuplicateColumn { entity: String, column: String },

    /// `id` is implicit and must not be declared as a mapped column.
    #[error("Entity {0} must not declare the implicit 'id' column")]
    ReservedColumn(String),

    /// The descriptor needs an `updated_at` timestamp column for its strategy.
    #[error("Entity {entity} requires an updated_at timestamp column ({reason})")]
    MissingUpdatedAt { entity: String, reason: String },

    /// A child spec names a parent column the child does not declare.
    #[error("Child entity {child} has no parent column '{column}'")]
    MissingParentColumn { child: String, column: String },

    /// An unpaged or positional descriptor that cannot be fetched as declared.
    ///
    /// ## When This Occurs
    /// - An unpaged entity with a page-walking strategy
    /// - Positional fields that do not name `id`
    #[error("Entity {entity} has an unusable response shape: {reason}")]
    InvalidShape { entity: String, reason: String },

    /// Two descriptors share a table name.
    #[error("Table '{0}' is used by more than one entity")]
    DuplicateTable(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
