//! # Deletion Detection
//!
//! Archives rows that disappeared upstream.
//!
//! ## Completeness Gate
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  FULL run                                                              │
//! │    page 1 ──observe──►┐                                                │
//! │    page 2 ──observe──►│ PopulationTracker                              │
//! │    ...                │   pages seen, ids seen, totals                 │
//! │    page N ──observe──►┘                                                │
//! │                        │                                                │
//! │                        ▼ into_complete()                                │
//! │            every page 1..=N, no early stop,                            │
//! │            records seen == total_entries,                              │
//! │            no id seen twice                                            │
//! │               │                          │                              │
//! │              yes                         no                             │
//! │               ▼                          ▼                              │
//! │      CompletePopulation       SyncError::IncompletePopulation          │
//! │               │                                                         │
//! │               ▼                                                         │
//! │      DeletionDetector::detect_and_archive                              │
//! │        children: local − remote → child tombstone                      │
//! │        parents:  COUNT/SUM equal? → Skipped                            │
//! │                  else local − remote → tombstone (+ children)          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`CompletePopulation`] can only come out of a tracker, so an
//! incremental or interrupted walk can never reach the detector.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use mirror_core::{EntityType, RecordId};
use mirror_db::{DbError, IdAggregate, RecordRepository};

use crate::error::{SyncError, SyncResult};
use crate::reconciler::PageOutcome;
use crate::source::Page;

// =============================================================================
// Population Tracker
// =============================================================================

/// Accumulates what a walk has seen of the remote collection.
#[derive(Debug)]
pub struct PopulationTracker {
    entity: String,
    total_pages: Option<u32>,
    total_entries: Option<u64>,
    /// First disagreement between pages about the totals.
    inconsistency: Option<String>,
    pages: BTreeSet<u32>,
    records_seen: u64,
    ids: HashSet<RecordId>,
    repeated_ids: u64,
    children: HashMap<String, HashSet<RecordId>>,
    stopped_early: bool,
}

impl PopulationTracker {
    pub fn new(entity: &str) -> Self {
        PopulationTracker {
            entity: entity.to_string(),
            total_pages: None,
            total_entries: None,
            inconsistency: None,
            pages: BTreeSet::new(),
            records_seen: 0,
            ids: HashSet::new(),
            repeated_ids: 0,
            children: HashMap::new(),
            stopped_early: false,
        }
    }

    /// Records one reconciled page.
    pub fn observe(&mut self, page: &Page, outcome: &PageOutcome) {
        match (self.total_pages, self.total_entries) {
            (None, _) | (_, None) => {
                self.total_pages = Some(page.last_page());
                self.total_entries = Some(page.total_entries);
            }
            (Some(pages), Some(entries)) => {
                if self.inconsistency.is_none()
                    && (pages != page.last_page() || entries != page.total_entries)
                {
                    self.inconsistency = Some(format!(
                        "page {} reports {} pages / {} entries, earlier pages reported {} / {}",
                        page.number,
                        page.last_page(),
                        page.total_entries,
                        pages,
                        entries
                    ));
                }
            }
        }

        self.pages.insert(page.number);
        self.records_seen += page.records.len() as u64;

        for id in &outcome.ids {
            if !self.ids.insert(*id) {
                self.repeated_ids += 1;
            }
        }

        for (field, ids) in &outcome.child_ids {
            self.children
                .entry(field.clone())
                .or_default()
                .extend(ids.iter().copied());
        }
    }

    /// The walk ended on a boundary instead of the last page.
    pub fn mark_stopped_early(&mut self) {
        self.stopped_early = true;
    }

    /// `total_entries` as reported by the first page.
    pub fn total_entries(&self) -> Option<u64> {
        self.total_entries
    }

    /// Raw records seen, rejected ones included.
    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    /// Hands out the id population if, and only if, it covers the whole
    /// remote collection.
    ///
    /// ## Errors
    /// * `SyncError::IncompletePopulation` - with the first reason found
    pub fn into_complete(self) -> SyncResult<CompletePopulation> {
        let incomplete = |reason: String| SyncError::IncompletePopulation {
            entity: self.entity.clone(),
            reason,
        };

        let (Some(last_page), Some(total_entries)) = (self.total_pages, self.total_entries) else {
            return Err(incomplete("no page was fetched".into()));
        };

        if self.stopped_early {
            return Err(incomplete("walk stopped before the last page".into()));
        }

        if let Some(reason) = &self.inconsistency {
            return Err(incomplete(reason.clone()));
        }

        if let Some(missing) = (1..=last_page).find(|p| !self.pages.contains(p)) {
            return Err(incomplete(format!("page {} of {} was not fetched", missing, last_page)));
        }

        if self.records_seen != total_entries {
            return Err(incomplete(format!(
                "fetched {} of {} records",
                self.records_seen, total_entries
            )));
        }

        if self.repeated_ids > 0 {
            return Err(incomplete(format!(
                "{} ids appeared on more than one page",
                self.repeated_ids
            )));
        }

        Ok(CompletePopulation {
            entity: self.entity,
            ids: self.ids,
            children: self.children,
        })
    }
}

/// Every id of a remote collection, as proven by a [`PopulationTracker`].
#[derive(Debug)]
pub struct CompletePopulation {
    entity: String,
    ids: HashSet<RecordId>,
    children: HashMap<String, HashSet<RecordId>>,
}

impl CompletePopulation {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn ids(&self) -> &HashSet<RecordId> {
        &self.ids
    }

    /// Child ids gathered from `field` of every parent.
    pub fn child_ids(&self, field: &str) -> Option<&HashSet<RecordId>> {
        self.children.get(field)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// =============================================================================
// Deletion Detector
// =============================================================================

/// What a deletion check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Local and remote agree; nothing was archived.
    Skipped,
    /// `rows` parents archived; `children` child rows moved with them or
    /// archived on their own.
    Archived { rows: u64, children: u64 },
}

impl DeletionOutcome {
    pub fn archived(&self) -> u64 {
        match self {
            DeletionOutcome::Skipped => 0,
            DeletionOutcome::Archived { rows, .. } => *rows,
        }
    }

    pub fn children_archived(&self) -> u64 {
        match self {
            DeletionOutcome::Skipped => 0,
            DeletionOutcome::Archived { children, .. } => *children,
        }
    }
}

/// Diffs a complete remote population against the live table.
#[derive(Debug, Clone)]
pub struct DeletionDetector {
    records: RecordRepository,
}

impl DeletionDetector {
    pub fn new(records: RecordRepository) -> Self {
        DeletionDetector { records }
    }

    /// Archives every local row whose id is absent from `population`.
    ///
    /// ## Errors
    /// * `SyncError::SuspiciousEmptyPopulation` - remote listed nothing but
    ///   the table has rows
    /// * `SyncError::Internal` - population belongs to another entity
    pub async fn detect_and_archive(
        &self,
        entity: &EntityType,
        population: &CompletePopulation,
    ) -> SyncResult<DeletionOutcome> {
        if population.entity != entity.name {
            return Err(SyncError::Internal(format!(
                "population of {} offered to {}",
                population.entity, entity.name
            )));
        }

        if !entity.tracks_deletions() {
            debug!(entity = %entity.name, "Entity keeps no tombstones, skipping deletion check");
            return Ok(DeletionOutcome::Skipped);
        }

        let mut children_archived = self.archive_children(entity, population).await?;

        let local = self.records.id_aggregate(entity).await?;
        if population.is_empty() && local.count > 0 {
            return Err(SyncError::SuspiciousEmptyPopulation {
                entity: entity.name.clone(),
                local: local.count,
            });
        }

        let remote = IdAggregate::of(population.ids());
        if local == remote {
            debug!(entity = %entity.name, count = local.count, "Id aggregates match");
            return Ok(if children_archived == 0 {
                DeletionOutcome::Skipped
            } else {
                DeletionOutcome::Archived {
                    rows: 0,
                    children: children_archived,
                }
            });
        }

        let mut rows = 0;
        for id in self.records.ids(entity).await? {
            if population.ids().contains(&id) {
                continue;
            }
            match self.records.archive(entity, id).await {
                Ok(moved_children) => {
                    rows += 1;
                    children_archived += moved_children;
                }
                Err(DbError::NotFound { .. }) => {
                    debug!(entity = %entity.name, id, "Row already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            entity = %entity.name,
            archived = rows,
            children_archived,
            "Deletion check complete"
        );
        Ok(DeletionOutcome::Archived {
            rows,
            children: children_archived,
        })
    }

    async fn archive_children(
        &self,
        entity: &EntityType,
        population: &CompletePopulation,
    ) -> SyncResult<u64> {
        let mut archived = 0;

        for child in &entity.children {
            if !child.entity.tracks_deletions() {
                continue;
            }

            let local = self.records.ids(&child.entity).await?;
            let remote = match population.child_ids(&child.field) {
                Some(ids) if !ids.is_empty() => ids,
                _ => {
                    if !local.is_empty() {
                        warn!(
                            entity = %child.entity.name,
                            local = local.len(),
                            "No child records listed upstream, skipping child deletion check"
                        );
                    }
                    continue;
                }
            };

            for id in local.into_iter().filter(|id| !remote.contains(id)) {
                match self.records.archive(&child.entity, id).await {
                    Ok(_) => archived += 1,
                    Err(DbError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(archived)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::Reconciler;
    use mirror_core::{catalog, ColumnSpec, ReconcileCounts};
    use mirror_db::{Database, DbConfig};
    use serde_json::{json, Value};

    fn widgets() -> EntityType {
        EntityType::new("widgets")
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::timestamp("updated_at"))
    }

    fn page(number: u32, ids: &[i64], total_pages: u32, total_entries: u64) -> (Page, PageOutcome) {
        let records: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        let outcome = PageOutcome {
            counts: ReconcileCounts::default(),
            child_counts: ReconcileCounts::default(),
            ids: ids.to_vec(),
            child_ids: Vec::new(),
        };
        (
            Page {
                number,
                records,
                total_pages,
                total_entries,
            },
            outcome,
        )
    }

    fn complete(entity: &str, ids: &[i64]) -> CompletePopulation {
        let mut tracker = PopulationTracker::new(entity);
        let (p, o) = page(1, ids, 1, ids.len() as u64);
        tracker.observe(&p, &o);
        tracker.into_complete().unwrap()
    }

    async fn seeded(entity: &EntityType, ids: &[i64]) -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.ensure_entity_tables(std::slice::from_ref(entity)).await.unwrap();
        let batch: Vec<Value> = ids.iter().map(|id| json!({"id": id, "name": "w"})).collect();
        Reconciler::new(db.records())
            .reconcile(entity, 0, &batch)
            .await
            .unwrap();
        db
    }

    #[test]
    fn test_tracker_complete_over_all_pages() {
        let mut tracker = PopulationTracker::new("widgets");
        for (p, o) in [page(1, &[1, 2], 2, 3), page(2, &[4], 2, 3)] {
            tracker.observe(&p, &o);
        }
        let population = tracker.into_complete().unwrap();
        assert_eq!(population.len(), 3);
        assert!(population.ids().contains(&4));
    }

    #[test]
    fn test_tracker_refuses_partial_walks() {
        // missing page 2
        let mut tracker = PopulationTracker::new("widgets");
        let (p, o) = page(1, &[1, 2], 2, 3);
        tracker.observe(&p, &o);
        assert!(matches!(
            tracker.into_complete(),
            Err(SyncError::IncompletePopulation { .. })
        ));

        // stopped on a boundary
        let mut tracker = PopulationTracker::new("widgets");
        let (p, o) = page(1, &[1, 2], 1, 2);
        tracker.observe(&p, &o);
        tracker.mark_stopped_early();
        assert!(tracker.into_complete().is_err());

        // record count disagrees with total_entries
        let mut tracker = PopulationTracker::new("widgets");
        let (p, o) = page(1, &[1, 2], 1, 5);
        tracker.observe(&p, &o);
        assert!(tracker.into_complete().is_err());

        // a record shifted onto the next page while walking
        let mut tracker = PopulationTracker::new("widgets");
        for (p, o) in [page(1, &[1, 2], 2, 4), page(2, &[2, 3], 2, 4)] {
            tracker.observe(&p, &o);
        }
        assert!(tracker.into_complete().is_err());

        // nothing fetched
        assert!(PopulationTracker::new("widgets").into_complete().is_err());
    }

    #[tokio::test]
    async fn test_archives_exactly_the_missing_row() {
        let entity = widgets();
        let db = seeded(&entity, &[1, 2, 3, 4]).await;
        let detector = DeletionDetector::new(db.records());

        let outcome = detector
            .detect_and_archive(&entity, &complete("widgets", &[1, 2, 4]))
            .await
            .unwrap();

        assert_eq!(outcome, DeletionOutcome::Archived { rows: 1, children: 0 });
        assert_eq!(db.records().ids(&entity).await.unwrap(), vec![1, 2, 4]);
        assert_eq!(db.records().tombstone_ids(&entity).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_matching_aggregates_skip() {
        let entity = widgets();
        let db = seeded(&entity, &[1, 2]).await;
        let detector = DeletionDetector::new(db.records());

        let outcome = detector
            .detect_and_archive(&entity, &complete("widgets", &[1, 2]))
            .await
            .unwrap();
        assert_eq!(outcome, DeletionOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_empty_population_is_refused() {
        let entity = widgets();
        let db = seeded(&entity, &[1, 2]).await;
        let detector = DeletionDetector::new(db.records());

        let result = detector
            .detect_and_archive(&entity, &complete("widgets", &[]))
            .await;
        assert!(matches!(
            result,
            Err(SyncError::SuspiciousEmptyPopulation { local: 2, .. })
        ));
        assert_eq!(db.records().count(&entity).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wrong_entity_population_is_refused() {
        let entity = widgets();
        let db = seeded(&entity, &[1]).await;
        let detector = DeletionDetector::new(db.records());

        let result = detector
            .detect_and_archive(&entity, &complete("gadgets", &[1]))
            .await;
        assert!(matches!(result, Err(SyncError::Internal(_))));
    }

    #[tokio::test]
    async fn test_child_rows_are_diffed_before_parents() {
        let tickets = catalog::tickets();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.ensure_entity_tables(std::slice::from_ref(&tickets)).await.unwrap();
        let reconciler = Reconciler::new(db.records());

        let first = vec![
            json!({"id": 1, "subject": "a", "comments": [{"id": 11}, {"id": 12}]}),
            json!({"id": 2, "subject": "b", "comments": [{"id": 21}]}),
        ];
        reconciler.reconcile(&tickets, 0, &first).await.unwrap();

        // comment 12 removed upstream, ticket 2 deleted with its comment
        let second = vec![json!({"id": 1, "subject": "a", "comments": [{"id": 11}]})];
        let outcome = reconciler.reconcile(&tickets, 0, &second).await.unwrap();

        let mut tracker = PopulationTracker::new("tickets");
        let p = Page {
            number: 1,
            records: second.clone(),
            total_pages: 1,
            total_entries: 1,
        };
        tracker.observe(&p, &outcome);
        let population = tracker.into_complete().unwrap();

        let detector = DeletionDetector::new(db.records());
        let result = detector.detect_and_archive(&tickets, &population).await.unwrap();
        assert_eq!(result, DeletionOutcome::Archived { rows: 1, children: 2 });

        let comments = &tickets.children[0].entity;
        assert_eq!(db.records().ids(comments).await.unwrap(), vec![11]);
        assert_eq!(db.records().tombstone_ids(comments).await.unwrap(), vec![12, 21]);
        assert_eq!(db.records().tombstone_ids(&tickets).await.unwrap(), vec![2]);
    }
}
