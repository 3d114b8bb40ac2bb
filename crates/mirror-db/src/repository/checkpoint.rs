//! # Checkpoint Repository
//!
//! Per-entity "last successful run start time".
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  run INIT          get("tickets")          → 1717000000 (or 0)          │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  pages fetched + reconciled ...                                         │
//! │     │                                                                   │
//! │     ├── any page failed / cancelled ──► checkpoint untouched            │
//! │     ▼                                                                   │
//! │  CHECKPOINT_COMMIT set("tickets", run.started_at)   (exactly once)      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::error::DbResult;

/// One stored checkpoint row.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Checkpoint {
    pub entity: String,
    /// UNIX seconds.
    pub last_run_at: i64,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// Repository for the `sync_checkpoints` table.
#[derive(Debug, Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    /// Creates a new CheckpointRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CheckpointRepository { pool }
    }

    /// Returns the checkpoint for `entity`, or 0 if it never completed a run.
    pub async fn get(&self, entity: &str) -> DbResult<i64> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_run_at FROM sync_checkpoints WHERE entity = ?1")
                .bind(entity)
                .fetch_optional(&self.pool)
                .await?;

        Ok(last.unwrap_or(0))
    }

    /// Overwrites the checkpoint for `entity`.
    pub async fn set(&self, entity: &str, last_run_at: i64) -> DbResult<()> {
        debug!(entity = %entity, last_run_at, "Committing checkpoint");

        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (entity, last_run_at, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity)
        .bind(last_run_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists every stored checkpoint, by entity name.
    pub async fn list(&self) -> DbResult<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, Checkpoint>(
            "SELECT entity, last_run_at, updated_at FROM sync_checkpoints ORDER BY entity",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_missing_checkpoint_is_zero() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert_eq!(db.checkpoints().get("tickets").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.checkpoints();

        repo.set("tickets", 1_700_000_000).await.unwrap();
        repo.set("tickets", 1_700_000_600).await.unwrap();
        repo.set("invoices", 42).await.unwrap();

        assert_eq!(repo.get("tickets").await.unwrap(), 1_700_000_600);

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].entity, "invoices");
        assert_eq!(all[1].last_run_at, 1_700_000_600);
    }
}
