//! # Sync Orchestrator
//!
//! Drives one run of one entity type from start to checkpoint.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  INIT ──► FETCHING ◄──► RECONCILING ──► DELETION_CHECK ──┐              │
//! │             │    (page by page)   │      (FULL only)      │              │
//! │             │                     │                       ▼              │
//! │             │                     └────────────► CHECKPOINT_COMMIT       │
//! │             │                                             │              │
//! │             ▼                                             ▼              │
//! │          FAILED ◄── source error, storage error,        DONE             │
//! │                     cancellation                (SUCCEEDED / PARTIAL)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Page Walks
//! | Mode / strategy          | Pages                          | Stops after                     |
//! |--------------------------|--------------------------------|---------------------------------|
//! | FULL                     | 1 ..= total                    | last page                       |
//! | INCREMENTAL SinceFilter  | 1 ..= total, server filtered   | last page                       |
//! | INCREMENTAL ForwardScan  | 1, 2, ...                      | first page with an older record |
//! | INCREMENTAL BackwardScan | 1 (for totals), total, ..., 1  | first page with an older record |
//! | INCREMENTAL Exhaustive   | 1 ..= total                    | last page                       |
//!
//! Only a FULL walk that reached its last page may feed the deletion
//! detector, and the checkpoint moves only when every intended page was
//! fetched and written.
//!
//! ## Run Exclusion
//! A run first claims its entity in the in-process [`RunLocks`], then takes
//! a lease row in `sync_locks` so other processes on the same database are
//! refused too. The lease is renewed before every page and released once
//! the run is recorded; a crashed holder's lease lapses after its TTL.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mirror_core::{
    transform, EntityType, IncrementalStrategy, RunPhase, RunStatus, SyncMode, SyncRun,
    SECONDS_PER_DAY,
};
use mirror_db::Database;

use crate::deletion::{DeletionDetector, PopulationTracker};
use crate::error::{SyncError, SyncResult};
use crate::reconciler::Reconciler;
use crate::source::{Page, PageFilter, PageSource};

// =============================================================================
// Run Options
// =============================================================================

/// How a caller wants an entity synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: SyncMode,
    /// Overrides the entity's default incremental window.
    pub lookback_days: Option<u32>,
}

impl RunOptions {
    pub fn incremental() -> Self {
        RunOptions {
            mode: SyncMode::Incremental,
            lookback_days: None,
        }
    }

    pub fn full() -> Self {
        RunOptions {
            mode: SyncMode::Full,
            lookback_days: None,
        }
    }

    /// INCREMENTAL over the last `days` days.
    pub fn lookback_days(days: u32) -> Self {
        RunOptions {
            mode: SyncMode::Incremental,
            lookback_days: Some(days),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::incremental()
    }
}

// =============================================================================
// Run Locks
// =============================================================================

/// Lifetime of a run lease between renewals.
pub const LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// In-process registry of entities with a run in flight.
///
/// Other processes are kept out by the lease in `sync_locks`.
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunLocks {
    /// Claims `entity` until the returned guard is dropped.
    ///
    /// ## Errors
    /// * `SyncError::AlreadyRunning` - another run holds the entity
    pub fn try_acquire(&self, entity: &str) -> SyncResult<RunLockGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(entity.to_string()) {
            return Err(SyncError::AlreadyRunning(entity.to_string()));
        }
        Ok(RunLockGuard {
            entity: entity.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_running(&self, entity: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entity)
    }
}

/// Releases its entity on drop.
#[derive(Debug)]
pub struct RunLockGuard {
    entity: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entity);
    }
}

// =============================================================================
// Walk Plan
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Walk {
    /// Pages 1, 2, ... up to the last one.
    Forward {
        filter: Option<PageFilter>,
        /// Stop after a page holding a record older than this.
        stop_before: Option<i64>,
    },
    /// Page 1 for the totals, then last page down to 1.
    Backward { boundary: i64 },
}

impl Walk {
    fn plan(entity: &EntityType, mode: SyncMode, boundary: i64) -> Self {
        match mode {
            SyncMode::Full => Walk::Forward {
                filter: None,
                stop_before: None,
            },
            SyncMode::Incremental => match entity.strategy {
                IncrementalStrategy::SinceFilter => Walk::Forward {
                    filter: Some(PageFilter::since(boundary)),
                    stop_before: None,
                },
                IncrementalStrategy::ForwardScan => Walk::Forward {
                    filter: None,
                    stop_before: Some(boundary),
                },
                IncrementalStrategy::BackwardScan => Walk::Backward { boundary },
                IncrementalStrategy::Exhaustive => Walk::Forward {
                    filter: None,
                    stop_before: None,
                },
            },
        }
    }
}

/// Lower bound of an incremental run.
///
/// Caller-supplied days win. An entity's default window is widened to the
/// checkpoint when the last success is older than the window. Without
/// either, the checkpoint itself is the boundary.
fn resolve_boundary(
    started_at: i64,
    checkpoint: i64,
    requested_days: Option<u32>,
    default_days: Option<u32>,
) -> i64 {
    let window = |days: u32| started_at - i64::from(days) * SECONDS_PER_DAY;
    match (requested_days, default_days) {
        (Some(days), _) => window(days),
        (None, Some(days)) if checkpoint > 0 => window(days).min(checkpoint),
        (None, Some(days)) => window(days),
        (None, None) => checkpoint,
    }
}

/// Oldest parseable `updated_at` on a page.
fn oldest_updated_at(records: &[Value]) -> Option<i64> {
    records
        .iter()
        .filter_map(|r| r.get("updated_at"))
        .filter_map(transform::parse_timestamp_value)
        .map(|ts| ts.timestamp())
        .min()
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs entity syncs against one database and one page source.
///
/// Clones share the lock registry and the cancellation token.
#[derive(Clone)]
pub struct SyncOrchestrator {
    db: Database,
    source: Arc<dyn PageSource>,
    reconciler: Reconciler,
    detector: DeletionDetector,
    locks: RunLocks,
    lease_ttl: Duration,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(db: Database, source: Arc<dyn PageSource>) -> Self {
        SyncOrchestrator {
            reconciler: Reconciler::new(db.records()),
            detector: DeletionDetector::new(db.records()),
            db,
            source,
            locks: RunLocks::default(),
            lease_ttl: LEASE_TTL,
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides [`LEASE_TTL`]; a page must arrive within it.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Token shared by every clone; cancelling it stops all runs at their
    /// next page boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs one sync of `entity`.
    ///
    /// Source, storage and cancellation failures do not surface as `Err`;
    /// they end the run FAILED and are reported in the returned summary.
    /// Every finished run is appended to the run history.
    ///
    /// ## Errors
    /// * `SyncError::FullNotSupported` - FULL asked of an entity without it
    /// * `SyncError::AlreadyRunning` - another run of `entity` is in flight,
    ///   in this process or another one on the same database
    /// * `SyncError::DatabaseError` - the lease could not be read or written
    pub async fn run(&self, entity: &EntityType, options: RunOptions) -> SyncResult<SyncRun> {
        if options.mode == SyncMode::Full && !entity.supports_full {
            return Err(SyncError::FullNotSupported(entity.name.clone()));
        }

        let _lock = self.locks.try_acquire(&entity.name)?;
        let mut run = SyncRun::start(&entity.name, options.mode);
        let owner = run.run_id.to_string();

        if !self
            .db
            .locks()
            .acquire(&entity.name, &owner, self.lease_ttl)
            .await?
        {
            warn!(entity = %entity.name, "Another process holds the run lease");
            return Err(SyncError::AlreadyRunning(entity.name.clone()));
        }

        info!(
            entity = %entity.name,
            run_id = %run.run_id,
            mode = %options.mode,
            "Sync run started"
        );

        if let Err(e) = self.execute(entity, options, &mut run).await {
            error!(
                entity = %entity.name,
                run_id = %run.run_id,
                error = %e,
                upstream = e.is_source_error(),
                "Sync run failed"
            );
            run.fail(e.to_string());
        }

        if let Err(e) = self.db.runs().record(&run).await {
            warn!(entity = %entity.name, error = %e, "Failed to record run history");
        }
        if let Err(e) = self.db.locks().release(&entity.name, &owner).await {
            warn!(entity = %entity.name, error = %e, "Failed to release run lease");
        }

        match run.status {
            RunStatus::Failed => {}
            RunStatus::Partial => warn!(entity = %entity.name, summary = %run, "Sync run partial"),
            _ => info!(entity = %entity.name, summary = %run, "Sync run finished"),
        }

        Ok(run)
    }

    async fn execute(
        &self,
        entity: &EntityType,
        options: RunOptions,
        run: &mut SyncRun,
    ) -> SyncResult<()> {
        let checkpoint = self.db.checkpoints().get(&entity.name).await?;

        let (cursor, boundary) = match options.mode {
            SyncMode::Full => (0, 0),
            SyncMode::Incremental => {
                let boundary = resolve_boundary(
                    run.started_at.timestamp(),
                    checkpoint,
                    options.lookback_days,
                    entity.default_lookback_days,
                );
                run.boundary = Some(boundary);
                (checkpoint, boundary)
            }
        };

        let walk = Walk::plan(entity, options.mode, boundary);
        debug!(entity = %entity.name, checkpoint, ?walk, "Walk planned");

        let mut tracker = PopulationTracker::new(&entity.name);
        match walk {
            Walk::Forward {
                filter,
                stop_before,
            } => {
                self.walk_forward(entity, cursor, filter, stop_before, run, &mut tracker)
                    .await?
            }
            Walk::Backward { boundary } => {
                self.walk_backward(entity, cursor, boundary, run, &mut tracker)
                    .await?
            }
        }

        let mut partial = run.counts.rejected > 0 || run.child_counts.rejected > 0;

        if options.mode == SyncMode::Full {
            run.remote_total = tracker.total_entries();

            if entity.tracks_deletions() {
                partial |= !self.check_deletions(entity, tracker, run).await?;
            }

            let local = self.db.records().count(entity).await?;
            run.local_total = Some(local);
            if run.remote_total != Some(local) {
                warn!(
                    entity = %entity.name,
                    local,
                    remote = ?run.remote_total,
                    "Local row count differs from remote total"
                );
            }
        }

        run.enter(RunPhase::CheckpointCommit);
        self.db
            .checkpoints()
            .set(&entity.name, run.checkpoint_timestamp())
            .await?;

        run.complete(partial);
        Ok(())
    }

    /// Runs the deletion check; `false` when it had to be skipped.
    async fn check_deletions(
        &self,
        entity: &EntityType,
        tracker: PopulationTracker,
        run: &mut SyncRun,
    ) -> SyncResult<bool> {
        let population = match tracker.into_complete() {
            Ok(population) => population,
            Err(e) => {
                warn!(entity = %entity.name, error = %e, "Skipping deletion check");
                return Ok(false);
            }
        };

        run.enter(RunPhase::DeletionCheck);
        match self.detector.detect_and_archive(entity, &population).await {
            Ok(outcome) => {
                run.deletion_checked = true;
                run.archived = outcome.archived();
                run.children_archived = outcome.children_archived();
                Ok(true)
            }
            Err(e @ SyncError::SuspiciousEmptyPopulation { .. }) => {
                warn!(entity = %entity.name, error = %e, "Skipping deletion check");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn walk_forward(
        &self,
        entity: &EntityType,
        cursor: i64,
        filter: Option<PageFilter>,
        stop_before: Option<i64>,
        run: &mut SyncRun,
        tracker: &mut PopulationTracker,
    ) -> SyncResult<()> {
        let mut number = 1;
        loop {
            let page = self.fetch(entity, number, filter.as_ref(), run).await?;
            let last_page = page.last_page();
            let crossed = match stop_before {
                Some(boundary) => oldest_updated_at(&page.records).is_some_and(|ts| ts < boundary),
                None => false,
            };

            self.reconcile(entity, cursor, &page, run, tracker).await?;

            if number >= last_page {
                break;
            }
            if crossed {
                info!(entity = %entity.name, page = number, "Reached lookback boundary");
                tracker.mark_stopped_early();
                break;
            }
            number += 1;
        }
        Ok(())
    }

    async fn walk_backward(
        &self,
        entity: &EntityType,
        cursor: i64,
        boundary: i64,
        run: &mut SyncRun,
        tracker: &mut PopulationTracker,
    ) -> SyncResult<()> {
        let first = self.fetch(entity, 1, None, run).await?;
        let last_page = first.last_page();
        if last_page == 1 {
            return self.reconcile(entity, cursor, &first, run, tracker).await;
        }
        drop(first);

        for number in (1..=last_page).rev() {
            let page = self.fetch(entity, number, None, run).await?;
            let crossed = oldest_updated_at(&page.records).is_some_and(|ts| ts < boundary);

            self.reconcile(entity, cursor, &page, run, tracker).await?;

            if crossed && number > 1 {
                info!(entity = %entity.name, page = number, "Reached lookback boundary");
                tracker.mark_stopped_early();
                break;
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        entity: &EntityType,
        number: u32,
        filter: Option<&PageFilter>,
        run: &mut SyncRun,
    ) -> SyncResult<Page> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let renewed = self
            .db
            .locks()
            .renew(&entity.name, &run.run_id.to_string(), self.lease_ttl)
            .await?;
        if !renewed {
            return Err(SyncError::LeaseLost(entity.name.clone()));
        }
        run.enter(RunPhase::Fetching);

        // Dropping an in-flight request (or retry sleep) writes nothing.
        let page = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            page = self.source.fetch_page(entity, number, filter) => page?,
        };

        run.record_page(page.records.len());
        debug!(
            entity = %entity.name,
            page = number,
            total_pages = page.total_pages,
            records = page.records.len(),
            "Fetched page"
        );
        Ok(page)
    }

    async fn reconcile(
        &self,
        entity: &EntityType,
        cursor: i64,
        page: &Page,
        run: &mut SyncRun,
        tracker: &mut PopulationTracker,
    ) -> SyncResult<()> {
        run.enter(RunPhase::Reconciling);
        let outcome = self.reconciler.reconcile(entity, cursor, &page.records).await?;

        if outcome.counts.rejected > 0 {
            warn!(
                entity = %entity.name,
                page = page.number,
                rejected = outcome.counts.rejected,
                "Records rejected"
            );
        }

        run.counts += outcome.counts;
        run.child_counts += outcome.child_counts;
        tracker.observe(page, &outcome);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
