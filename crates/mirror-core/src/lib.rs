//! # mirror-core: Pure Types for Record Mirror
//!
//! This crate holds the data model of the sync engine: records as the API
//! returns them, the entity descriptors that drive the generic engine, the
//! field transforms applied before a write, and the run summary threaded
//! through every sync run. It performs no I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Record Mirror Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    mirror-cli                                   │   │
//! │  │          mirror sync [ENTITY...] [--full] [--days N]            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    mirror-sync                                  │   │
//! │  │   PageSource ──► Reconciler ──► DeletionDetector ──► Checkpoint │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ mirror-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌───────────┐     │   │
//! │  │   │  record  │  │  entity  │  │ transform │  │   types   │     │   │
//! │  │   │  Record  │  │EntityType│  │ SqlValue  │  │  SyncRun  │     │   │
//! │  │   │ RecordId │  │ColumnSpec│  │ timestamps│  │ RunStatus │     │   │
//! │  │   └──────────┘  └──────────┘  └───────────┘  └───────────┘     │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    mirror-db (SQLite)                           │   │
//! │  │         checkpoints, live + tombstone tables, run history       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - Raw upstream records (`id`, `updated_at`, dotted lookups)
//! - [`entity`] - Entity descriptors, column specs, strategies
//! - [`transform`] - Field coercion and timestamp normalization
//! - [`catalog`] - The built-in entity descriptors
//! - [`types`] - `SyncRun`, `SyncMode`, `RunStatus`
//! - [`validation`] - Descriptor validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use mirror_core::catalog;
//! use mirror_core::record::Record;
//! use mirror_core::transform::SqlValue;
//! use serde_json::json;
//!
//! let payments = catalog::payments();
//! let record = Record::from_value(json!({
//!     "id": 9,
//!     "updated_at": "2024-05-01T12:00:00Z",
//!     "customer": { "id": 31, "business_and_full_name": "Acme / Ada" }
//! })).unwrap();
//!
//! let values = payments.row_values(&record);
//! let customer_id = payments.column_names().iter().position(|c| *c == "customer_id").unwrap();
//! assert_eq!(values[customer_id], SqlValue::Integer(31));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod catalog;
pub mod entity;
pub mod error;
pub mod record;
pub mod transform;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use entity::{ChangeDetection, ChildSpec, ColumnKind, ColumnSpec, EntityType, IncrementalStrategy};
pub use error::{CoreError, CoreResult, ValidationError};
pub use record::{Record, RecordId};
pub use transform::SqlValue;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Seconds in a lookback day.
pub const SECONDS_PER_DAY: i64 = 86_400;
