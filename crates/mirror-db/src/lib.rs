//! # mirror-db: Database Layer for Record Mirror
//!
//! This crate provides database access for the sync engine.
//! It uses SQLite for local storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Record Mirror Data Flow                          │
//! │                                                                         │
//! │  SyncOrchestrator (mirror-sync)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     mirror-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │   │   │
//! │  │   │               │    │ Checkpoint     │   │ 001_sync_    │   │   │
//! │  │   │ SqlitePool    │◄───│ Record         │   │  checkpoints │   │   │
//! │  │   │ WAL + busy    │    │ Run, Lock      │   │ 002_sync_runs│   │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   ~/.local/share/record-mirror/mirror.db                        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Checkpoint, record, run and lease repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mirror_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("mirror.db")).await?;
//! db.ensure_entity_tables(&mirror_core::catalog::all()).await?;
//!
//! let since = db.checkpoints().get("tickets").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::checkpoint::{Checkpoint, CheckpointRepository};
pub use repository::lock::{Lease, LockRepository};
pub use repository::record::{IdAggregate, PageTransaction, RecordRepository, StoredState};
pub use repository::run::RunRepository;
