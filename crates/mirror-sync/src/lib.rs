//! # mirror-sync: Sync Engine for Record Mirror
//!
//! Mirrors paginated REST collections into the local SQLite database.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           mirror-sync                                   │
//! │                                                                         │
//! │  SyncScheduler ── one task per entity type (JoinSet)                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncOrchestrator::run(entity, options)                                │
//! │       │   run lock, checkpoint, boundary, page walk                     │
//! │       │                                                                 │
//! │       ├──► PageSource (RetryingSource ─► PacedSource ─► HTTP)          │
//! │       │        fetch_page(entity, n, since?)                            │
//! │       │                                                                 │
//! │       ├──► Reconciler                                                   │
//! │       │        one transaction per page, parents then children          │
//! │       │                                                                 │
//! │       ├──► PopulationTracker ─► CompletePopulation (FULL only)          │
//! │       │        └──► DeletionDetector ─► tombstone tables                │
//! │       │                                                                 │
//! │       └──► checkpoint commit, run history                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - `mirror.toml` + environment overrides
//! - [`error`] - Sync error types
//! - [`source`] - `PageSource` trait, HTTP adapter, retry and pacing wrappers
//! - [`reconciler`] - Insert / update / skip decisions
//! - [`deletion`] - Completeness-gated deletion detection
//! - [`orchestrator`] - Per-entity run state machine
//! - [`scheduler`] - Concurrent multi-entity runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mirror_sync::{source, MirrorConfig, RunOptions, SyncOrchestrator, SyncScheduler};
//! use mirror_db::Database;
//!
//! let config = MirrorConfig::load(None)?;
//! let db = Database::new(config.db_config()).await?;
//! let entities = config.enabled_entities();
//! db.ensure_entity_tables(&entities).await?;
//!
//! let orchestrator = SyncOrchestrator::new(db, source::from_config(&config)?);
//! let reports = SyncScheduler::new(orchestrator)
//!     .run_all(entities, RunOptions::full())
//!     .await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod deletion;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod scheduler;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ApiSettings, DatabaseSettings, EntitySettings, MirrorConfig, RetrySettings};
pub use deletion::{CompletePopulation, DeletionDetector, DeletionOutcome, PopulationTracker};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{RunLockGuard, RunLocks, RunOptions, SyncOrchestrator};
pub use reconciler::{Decision, PageOutcome, Reconciler};
pub use scheduler::{EntityReport, SyncScheduler};
pub use source::{
    HttpPageSource, PacedSource, Page, PageFilter, PageSource, RetryPolicy, RetryingSource,
};
