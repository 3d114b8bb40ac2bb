//! # Run Lease Repository
//!
//! Cross-process "one run per entity" leases in `sync_locks`.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  acquire("tickets", run_id, ttl)                                        │
//! │     │   INSERT ... ON CONFLICT DO UPDATE ... WHERE expired              │
//! │     ├── row inserted or expired row taken over ──► true                 │
//! │     └── live row of another owner             ──► false                 │
//! │     ▼                                                                   │
//! │  renew("tickets", run_id, ttl)     before every page                    │
//! │     │   false once another owner took the row over                      │
//! │     ▼                                                                   │
//! │  release("tickets", run_id)        DONE / FAILED                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A process that dies mid-run leaves its row behind; the next acquire
//! after `expires_at` takes it over.

use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use std::time::Duration;
use tracing::debug;

use crate::error::DbResult;

/// One held lease.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Lease {
    pub entity: String,
    /// Run id of the holder.
    pub owner: String,
    /// UNIX seconds.
    pub acquired_at: i64,
    /// UNIX seconds.
    pub expires_at: i64,
}

impl Lease {
    /// True once the holder missed its renewal; the next acquire takes over.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }
}

/// Repository for the `sync_locks` table.
#[derive(Debug, Clone)]
pub struct LockRepository {
    pool: SqlitePool,
}

impl LockRepository {
    /// Creates a new LockRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LockRepository { pool }
    }

    /// Takes the lease on `entity` for `owner`.
    ///
    /// Returns `false` when another owner holds an unexpired lease.
    pub async fn acquire(&self, entity: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO sync_locks (entity, owner, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE sync_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(entity)
        .bind(owner)
        .bind(now)
        .bind(now + ttl_secs(ttl))
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(entity = %entity, owner = %owner, acquired, "Lease acquire");
        Ok(acquired)
    }

    /// Pushes the expiry of a lease `owner` still holds.
    ///
    /// Returns `false` when the lease is gone or held by someone else.
    pub async fn renew(&self, entity: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_locks SET expires_at = ?3 WHERE entity = ?1 AND owner = ?2",
        )
        .bind(entity)
        .bind(owner)
        .bind(Utc::now().timestamp() + ttl_secs(ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drops the lease if `owner` still holds it.
    pub async fn release(&self, entity: &str, owner: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM sync_locks WHERE entity = ?1 AND owner = ?2")
            .bind(entity)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() == 1;
        debug!(entity = %entity, owner = %owner, released, "Lease release");
        Ok(released)
    }

    /// Every stored lease, expired ones included, by entity name.
    pub async fn list(&self) -> DbResult<Vec<Lease>> {
        let rows = sqlx::query_as::<_, Lease>(
            "SELECT entity, owner, acquired_at, expires_at FROM sync_locks ORDER BY entity",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2).max(1)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn test_two_handles_race_for_one_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        let first = Database::new(DbConfig::new(&path)).await.unwrap();
        let second = Database::new(DbConfig::new(&path)).await.unwrap();

        let first_locks = first.locks();
        let second_locks = second.locks();
        let (a, b) = tokio::join!(
            first_locks.acquire("tickets", "run-a", TTL),
            second_locks.acquire("tickets", "run-b", TTL),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one handle wins the lease");

        let (winner, loser, winner_owner, loser_owner) = if a {
            (&first, &second, "run-a", "run-b")
        } else {
            (&second, &first, "run-b", "run-a")
        };

        // the loser cannot renew or release what it does not hold
        assert!(!loser.locks().renew("tickets", loser_owner, TTL).await.unwrap());
        assert!(!loser.locks().release("tickets", loser_owner).await.unwrap());
        assert!(!loser.locks().acquire("tickets", loser_owner, TTL).await.unwrap());

        // other entities are independent
        assert!(loser.locks().acquire("invoices", loser_owner, TTL).await.unwrap());

        assert!(winner.locks().renew("tickets", winner_owner, TTL).await.unwrap());
        assert!(winner.locks().release("tickets", winner_owner).await.unwrap());
        assert!(loser.locks().acquire("tickets", loser_owner, TTL).await.unwrap());

        let leases = winner.locks().list().await.unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases.iter().all(|l| l.owner == loser_owner));

        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let locks = db.locks();
        let past = Utc::now().timestamp() - 3600;

        sqlx::query("INSERT INTO sync_locks (entity, owner, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)")
            .bind("tickets")
            .bind("crashed-run")
            .bind(past - 600)
            .bind(past)
            .execute(db.pool())
            .await
            .unwrap();

        assert!(locks.acquire("tickets", "new-run", TTL).await.unwrap());

        let leases = locks.list().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].owner, "new-run");
        assert!(!leases[0].is_expired());

        // the old holder finds out on its next renewal
        assert!(!locks.renew("tickets", "crashed-run", TTL).await.unwrap());
    }
}
