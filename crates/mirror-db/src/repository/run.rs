//! # Run History Repository
//!
//! Append-only log of finished sync runs, read back by `mirror status`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use mirror_core::{ReconcileCounts, RunPhase, RunStatus, SyncMode, SyncRun};

use crate::error::{DbError, DbResult};

/// Row shape of `sync_runs`.
#[derive(Debug, FromRow)]
struct SyncRunRow {
    run_id: String,
    entity: String,
    mode: String,
    status: String,
    boundary: Option<i64>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    pages_fetched: i64,
    records_fetched: i64,
    added: i64,
    updated: i64,
    skipped: i64,
    rejected: i64,
    child_added: i64,
    child_updated: i64,
    child_skipped: i64,
    child_rejected: i64,
    deletion_checked: bool,
    archived: i64,
    children_archived: i64,
    remote_total: Option<i64>,
    local_total: Option<i64>,
    error: Option<String>,
}

impl TryFrom<SyncRunRow> for SyncRun {
    type Error = DbError;

    fn try_from(row: SyncRunRow) -> Result<Self, Self::Error> {
        let run_id = Uuid::parse_str(&row.run_id)
            .map_err(|e| DbError::Corrupt(format!("bad run id {}: {}", row.run_id, e)))?;
        let mode: SyncMode = row.mode.parse().map_err(DbError::Corrupt)?;
        let status: RunStatus = row.status.parse().map_err(DbError::Corrupt)?;

        Ok(SyncRun {
            run_id,
            entity: row.entity,
            mode,
            boundary: row.boundary,
            started_at: row.started_at,
            finished_at: row.finished_at,
            pages_fetched: row.pages_fetched as u32,
            records_fetched: row.records_fetched as u64,
            counts: ReconcileCounts {
                added: row.added as u64,
                updated: row.updated as u64,
                skipped: row.skipped as u64,
                rejected: row.rejected as u64,
            },
            child_counts: ReconcileCounts {
                added: row.child_added as u64,
                updated: row.child_updated as u64,
                skipped: row.child_skipped as u64,
                rejected: row.child_rejected as u64,
            },
            deletion_checked: row.deletion_checked,
            archived: row.archived as u64,
            children_archived: row.children_archived as u64,
            remote_total: row.remote_total.map(|v| v as u64),
            local_total: row.local_total.map(|v| v as u64),
            phase: if status == RunStatus::Failed {
                RunPhase::Failed
            } else {
                RunPhase::Done
            },
            status,
            error: row.error,
        })
    }
}

/// Repository for the `sync_runs` table.
#[derive(Debug, Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    /// Creates a new RunRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RunRepository { pool }
    }

    /// Appends a finished run.
    pub async fn record(&self, run: &SyncRun) -> DbResult<()> {
        debug!(run_id = %run.run_id, entity = %run.entity, status = %run.status, "Recording run");

        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                run_id, entity, mode, status, boundary, started_at, finished_at,
                pages_fetched, records_fetched, added, updated, skipped, rejected,
                child_added, child_updated, child_skipped, child_rejected,
                deletion_checked, archived, children_archived,
                remote_total, local_total, error
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17,
                ?18, ?19, ?20,
                ?21, ?22, ?23
            )
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.entity)
        .bind(run.mode.to_string())
        .bind(run.status.to_string())
        .bind(run.boundary)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.pages_fetched as i64)
        .bind(run.records_fetched as i64)
        .bind(run.counts.added as i64)
        .bind(run.counts.updated as i64)
        .bind(run.counts.skipped as i64)
        .bind(run.counts.rejected as i64)
        .bind(run.child_counts.added as i64)
        .bind(run.child_counts.updated as i64)
        .bind(run.child_counts.skipped as i64)
        .bind(run.child_counts.rejected as i64)
        .bind(run.deletion_checked)
        .bind(run.archived as i64)
        .bind(run.children_archived as i64)
        .bind(run.remote_total.map(|v| v as i64))
        .bind(run.local_total.map(|v| v as i64))
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent runs across all entities, newest first.
    pub async fn latest(&self, limit: u32) -> DbResult<Vec<SyncRun>> {
        let rows = sqlx::query_as::<_, SyncRunRow>(
            "SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncRun::try_from).collect()
    }

    /// Most recent runs of one entity, newest first.
    pub async fn latest_for(&self, entity: &str, limit: u32) -> DbResult<Vec<SyncRun>> {
        let rows = sqlx::query_as::<_, SyncRunRow>(
            "SELECT * FROM sync_runs WHERE entity = ?1 ORDER BY started_at DESC LIMIT ?2",
        )
        .bind(entity)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncRun::try_from).collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
