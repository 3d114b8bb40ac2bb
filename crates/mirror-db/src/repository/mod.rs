//! # Repository Module
//!
//! Database repository implementations for the sync engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Orchestrator                                                           │
//! │       │                                                                 │
//! │       │  db.checkpoints().get("tickets")                                │
//! │       │  db.records().begin_page()                                      │
//! │       │  db.runs().record(&run)                                         │
//! │       │  db.locks().acquire("tickets", run_id, ttl)                     │
//! │       ▼                                                                 │
//! │  CheckpointRepository   sync_checkpoints                               │
//! │  RecordRepository       <entity> / deleted_<entity> / children         │
//! │  RunRepository          sync_runs                                      │
//! │  LockRepository         sync_locks                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`CheckpointRepository`](checkpoint::CheckpointRepository) - Last successful run per entity
//! - [`RecordRepository`](record::RecordRepository) - Live/tombstone rows, page transactions
//! - [`RunRepository`](run::RunRepository) - Run history
//! - [`LockRepository`](lock::LockRepository) - Cross-process run leases

pub mod checkpoint;
pub mod lock;
pub mod record;
pub mod run;
