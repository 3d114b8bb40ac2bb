//! # Run Types
//!
//! Value types that describe a sync run from start to finish.
//!
//! ## Run Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   INIT ──► FETCHING ──► RECONCILING ──► DELETION_CHECK ──┐             │
//! │               ▲              │          (FULL + complete) │             │
//! │               └── next page ─┘                            ▼             │
//! │               │              │              CHECKPOINT_COMMIT ──► DONE  │
//! │               ▼              ▼                                          │
//! │            FAILED ◄──────────┘       (absorbing, nothing committed)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A single [`SyncRun`] is threaded through the whole run; every component
//! adds its counts to it instead of keeping its own tallies.

use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Sync Mode
// =============================================================================

/// FULL walks every page and may feed the deletion detector.
/// INCREMENTAL walks only what changed since a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "FULL"),
            SyncMode::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FULL" => Ok(SyncMode::Full),
            "INCREMENTAL" => Ok(SyncMode::Incremental),
            _ => Err(format!("Unknown sync mode: {}", s)),
        }
    }
}

// =============================================================================
// Run Status / Phase
// =============================================================================

/// Terminal outcome of a run (`Running` until it gets there).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    /// Every intended page fetched and reconciled cleanly.
    Succeeded,
    /// Every page fetched, but records were rejected or FULL totals
    /// disagreed so the deletion check was skipped.
    Partial,
    /// Aborted by a fetch/storage error or cancellation; no checkpoint.
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "PARTIAL" => Ok(RunStatus::Partial),
            "FAILED" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Where the orchestrator's state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Fetching,
    Reconciling,
    DeletionCheck,
    CheckpointCommit,
    Done,
    Failed,
}

// =============================================================================
// Reconcile Counts
// =============================================================================

/// Outcome tallies of merging records into storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Records without a usable id.
    pub rejected: u64,
}

impl ReconcileCounts {
    /// Rows inserted or updated.
    pub fn written(&self) -> u64 {
        self.added + self.updated
    }

    pub fn total(&self) -> u64 {
        self.added + self.updated + self.skipped + self.rejected
    }
}

impl AddAssign for ReconcileCounts {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.rejected += other.rejected;
    }
}

// =============================================================================
// Sync Run
// =============================================================================

/// Summary of one sync run for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub entity: String,
    pub mode: SyncMode,
    /// UNIX lookback boundary for INCREMENTAL runs.
    pub boundary: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_fetched: u32,
    pub records_fetched: u64,
    pub counts: ReconcileCounts,
    pub child_counts: ReconcileCounts,
    pub deletion_checked: bool,
    pub archived: u64,
    pub children_archived: u64,
    /// `meta.total_entries` reported by the source.
    pub remote_total: Option<u64>,
    /// Local row count after a FULL run.
    pub local_total: Option<u64>,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub error: Option<String>,
}

impl SyncRun {
    /// Starts a run at the current time.
    pub fn start(entity: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            entity: entity.into(),
            mode,
            boundary: None,
            started_at: Utc::now(),
            finished_at: None,
            pages_fetched: 0,
            records_fetched: 0,
            counts: ReconcileCounts::default(),
            child_counts: ReconcileCounts::default(),
            deletion_checked: false,
            archived: 0,
            children_archived: 0,
            remote_total: None,
            local_total: None,
            status: RunStatus::Running,
            phase: RunPhase::Init,
            error: None,
        }
    }

    /// Moves to `phase`. Terminal runs never move again.
    pub fn enter(&mut self, phase: RunPhase) {
        if !self.status.is_terminal() {
            self.phase = phase;
        }
    }

    /// Notes one fetched page of `records` records.
    pub fn record_page(&mut self, records: usize) {
        self.pages_fetched += 1;
        self.records_fetched += records as u64;
    }

    /// Ends the run as SUCCEEDED or PARTIAL.
    pub fn complete(&mut self, partial: bool) {
        if self.status.is_terminal() {
            return;
        }
        self.phase = RunPhase::Done;
        self.status = if partial {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        };
        self.finished_at = Some(Utc::now());
    }

    /// Ends the run as FAILED, keeping all counts gathered so far.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.phase = RunPhase::Failed;
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Checkpoint value committed by a successful run.
    pub fn checkpoint_timestamp(&self) -> i64 {
        self.started_at.timestamp()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

impl fmt::Display for SyncRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: pages={} fetched={} added={} updated={} skipped={} rejected={}",
            self.entity,
            self.mode,
            self.status,
            self.pages_fetched,
            self.records_fetched,
            self.counts.added,
            self.counts.updated,
            self.counts.skipped,
            self.counts.rejected,
        )?;
        if self.child_counts.total() > 0 {
            write!(
                f,
                " children(added={} updated={})",
                self.child_counts.added, self.child_counts.updated
            )?;
        }
        if self.deletion_checked {
            write!(
                f,
                " archived={} children_archived={}",
                self.archived, self.children_archived
            )?;
        }
        if let Some(err) = &self.error {
            write!(f, " error=\"{}\"", err)?;
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate() {
        let mut total = ReconcileCounts::default();
        total += ReconcileCounts { added: 2, updated: 1, skipped: 3, rejected: 0 };
        total += ReconcileCounts { added: 0, updated: 1, skipped: 0, rejected: 1 };
        assert_eq!(total.written(), 4);
        assert_eq!(total.total(), 8);
    }

    #[test]
    fn test_failed_is_absorbing() {
        let mut run = SyncRun::start("tickets", SyncMode::Incremental);
        run.enter(RunPhase::Fetching);
        run.fail("page 2: HTTP 500");
        run.enter(RunPhase::CheckpointCommit);
        run.complete(false);

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phase, RunPhase::Failed);
        assert_eq!(run.error.as_deref(), Some("page 2: HTTP 500"));
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_complete_partial() {
        let mut run = SyncRun::start("widgets", SyncMode::Full);
        run.record_page(3);
        run.record_page(2);
        run.complete(true);

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.phase, RunPhase::Done);
        assert_eq!(run.pages_fetched, 2);
        assert_eq!(run.records_fetched, 5);
        assert!(run.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_mode_and_status_parse() {
        assert_eq!("full".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert_eq!("PARTIAL".parse::<RunStatus>().unwrap(), RunStatus::Partial);
        assert!("sometimes".parse::<SyncMode>().is_err());
    }
}
