//! # Multi-Entity Scheduler
//!
//! Runs several entity types at once, one task each.
//!
//! ```text
//! run_all([tickets, invoices, products], FULL)
//!     │
//!     ├── spawn ──► tickets   FULL         ─┐
//!     ├── spawn ──► invoices  FULL          ├─► JoinSet ──► reports (input order)
//!     └── spawn ──► comments  INCREMENTAL  ─┘   (no FULL listing: falls back)
//! ```
//!
//! Pages inside one run stay sequential; only whole runs overlap.

use std::collections::HashMap;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

use mirror_core::{EntityType, RunStatus, SyncMode, SyncRun};

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{RunOptions, SyncOrchestrator};

/// Outcome of one entity in a scheduled batch.
#[derive(Debug)]
pub struct EntityReport {
    pub entity: String,
    pub result: SyncResult<SyncRun>,
}

impl EntityReport {
    /// True for a FAILED run or a run that never started.
    pub fn is_failure(&self) -> bool {
        match &self.result {
            Ok(run) => run.status == RunStatus::Failed,
            Err(_) => true,
        }
    }
}

/// Fans entity runs out over a [`JoinSet`].
#[derive(Clone)]
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
}

impl SyncScheduler {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        SyncScheduler { orchestrator }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// Mode actually used for `entity`: FULL falls back to INCREMENTAL for
    /// entities that cannot be fully listed.
    pub fn options_for(entity: &EntityType, requested: RunOptions) -> RunOptions {
        if requested.mode == SyncMode::Full && !entity.supports_full {
            info!(entity = %entity.name, "Full sync not supported, running incremental");
            return RunOptions {
                mode: SyncMode::Incremental,
                ..requested
            };
        }
        requested
    }

    /// Runs every entity concurrently and waits for all of them.
    ///
    /// Reports come back in the order of `entities`.
    pub async fn run_all(&self, entities: Vec<EntityType>, options: RunOptions) -> Vec<EntityReport> {
        let names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
        let mut slots: Vec<Option<SyncResult<SyncRun>>> = names.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();
        let mut task_slots = HashMap::new();

        info!(entities = names.len(), mode = %options.mode, "Starting scheduled sync");

        for (index, entity) in entities.into_iter().enumerate() {
            let orchestrator = self.orchestrator.clone();
            let options = Self::options_for(&entity, options);
            let handle =
                tasks.spawn(async move { (index, orchestrator.run(&entity, options).await) });
            task_slots.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => match task_slots.get(&e.id()).copied() {
                    Some(index) => {
                        error!(entity = %names[index], error = %e, "Entity task did not finish");
                        slots[index] = Some(Err(task_failure(e)));
                    }
                    None => error!(error = %e, "Unknown task did not finish"),
                },
            }
        }

        names
            .into_iter()
            .zip(slots)
            .map(|(entity, slot)| EntityReport {
                entity,
                result: slot.unwrap_or_else(|| {
                    Err(SyncError::TaskFailed("task ended without a result".to_string()))
                }),
            })
            .collect()
    }
}

/// Panic message of a crashed task, or the join error itself.
fn task_failure(err: JoinError) -> SyncError {
    match err.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "non-string panic payload".to_string());
            SyncError::TaskFailed(format!("panicked: {}", message))
        }
        Err(err) => SyncError::from(err),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{database, widget, widgets, ScriptedSource};
    use mirror_core::ColumnSpec;
    use std::sync::Arc;

    fn gadgets() -> EntityType {
        EntityType::new("gadgets")
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::timestamp("updated_at"))
            .supports_full(false)
    }

    #[tokio::test]
    async fn test_runs_entities_concurrently_in_order() {
        let entities = vec![widgets(), gadgets()];
        let db = database(&entities).await;
        let source = Arc::new(ScriptedSource::new(vec![
            vec![widget(1, 1_700_000_000)],
            vec![widget(2, 1_700_000_000)],
        ]));
        let scheduler = SyncScheduler::new(SyncOrchestrator::new(db.clone(), source.clone()));

        let reports = scheduler.run_all(entities, RunOptions::full()).await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].entity, "widgets");
        assert_eq!(reports[1].entity, "gadgets");
        assert!(reports.iter().all(|r| !r.is_failure()));

        let widgets_run = reports[0].result.as_ref().unwrap();
        let gadgets_run = reports[1].result.as_ref().unwrap();
        assert_eq!(widgets_run.mode, SyncMode::Full);
        assert_eq!(gadgets_run.mode, SyncMode::Incremental);
        assert_eq!(widgets_run.counts.added, 2);
        assert_eq!(gadgets_run.counts.added, 2);

        assert_eq!(source.calls_for("widgets"), vec![1, 2]);
        assert_eq!(source.calls_for("gadgets"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_run_is_reported() {
        let entities = vec![widgets()];
        let db = database(&entities).await;
        let source = Arc::new(
            ScriptedSource::new(vec![vec![widget(1, 1_700_000_000)]])
                .failing_on(1, || SyncError::Http { status: 403, body: "forbidden".into() }),
        );
        let scheduler = SyncScheduler::new(SyncOrchestrator::new(db, source));

        let reports = scheduler.run_all(entities, RunOptions::incremental()).await;
        assert!(reports[0].is_failure());
    }

    #[tokio::test]
    async fn test_panicked_tasks_report_against_their_entity() {
        let gizmos = EntityType::new("gizmos").column(ColumnSpec::text("name"));
        let entities = vec![widgets(), gadgets(), gizmos];
        let db = database(&entities).await;
        let source = Arc::new(
            ScriptedSource::new(vec![vec![widget(1, 1_700_000_000)]])
                .panicking_for("widgets")
                .panicking_for("gadgets"),
        );
        let scheduler = SyncScheduler::new(SyncOrchestrator::new(db, source));

        let reports = scheduler.run_all(entities, RunOptions::incremental()).await;

        for report in &reports[..2] {
            match &report.result {
                Err(SyncError::TaskFailed(message)) => {
                    assert!(message.contains(&format!("{} source blew up", report.entity)));
                }
                other => panic!("expected TaskFailed for {}, got {:?}", report.entity, other),
            }
        }
        assert_eq!(reports[2].entity, "gizmos");
        assert!(!reports[2].is_failure());
    }

    #[test]
    fn test_options_fallback() {
        let requested = RunOptions {
            mode: SyncMode::Full,
            lookback_days: Some(3),
        };
        assert_eq!(SyncScheduler::options_for(&widgets(), requested), requested);

        let fallback = SyncScheduler::options_for(&gadgets(), requested);
        assert_eq!(fallback.mode, SyncMode::Incremental);
        assert_eq!(fallback.lookback_days, Some(3));
    }
}
