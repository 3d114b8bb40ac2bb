//! # Schema Migrations
//!
//! Two kinds of tables live in the mirror database:
//!
//! ```text
//! embedded, versioned (this module)      created from descriptors at startup
//! ─────────────────────────────────      ───────────────────────────────────
//! 001  sync_checkpoints                  tickets        deleted_tickets
//! 002  sync_runs                         comments       deleted_comments
//!                                        ...one live + one tombstone per entity
//! ```
//!
//! Bookkeeping tables are versioned here. Entity tables follow their
//! descriptors (`RecordRepository::ensure_tables`) and are never migrated.
//! Applied files are immutable; schema changes go in a new `NNN_name.sql`.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies every pending bookkeeping migration, in file order.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    debug!(embedded = MIGRATOR.migrations.len(), "Checking migrations");
    MIGRATOR.run(pool).await?;
    info!("Bookkeeping schema up to date");
    Ok(())
}

/// `(embedded, applied)` migration counts.
///
/// A database that was never migrated reports zero applied.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let embedded = MIGRATOR.migrations.len();
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success")
        .fetch_one(pool)
        .await
        .unwrap_or(0);
    Ok((embedded, usize::try_from(applied).unwrap_or(0)))
}
