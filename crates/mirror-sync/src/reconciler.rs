//! # Upsert Reconciler
//!
//! Folds one fetched page into the live table.
//!
//! ## Decision Per Record
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  raw JSON ──► Record ──► id?  ── no / bad ──► rejected                  │
//! │                           │                                             │
//! │                           ▼                                             │
//! │                    stored row for id?                                   │
//! │                     │              │                                    │
//! │                    no             yes                                   │
//! │                     │              │                                    │
//! │                     ▼              ▼                                    │
//! │                  INSERT     UpdatedAt:   incoming > stored              │
//! │                  added            and    incoming > cursor  ──► UPDATE  │
//! │                             ContentHash: digest differs                 │
//! │                                   and    incoming >= stored ──► UPDATE  │
//! │                             otherwise                         ──► skip  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A page is written in one transaction: parents first, then the nested
//! children of every parent on the page.

use serde_json::Value;
use tracing::{debug, warn};

use mirror_core::{ChangeDetection, EntityType, Record, RecordId, ReconcileCounts};
use mirror_db::{PageTransaction, RecordRepository, StoredState};

use crate::error::SyncResult;

// =============================================================================
// Types
// =============================================================================

/// What happens to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Insert,
    Update,
    Skip,
}

/// Result of reconciling one page.
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    pub counts: ReconcileCounts,
    pub child_counts: ReconcileCounts,
    /// Valid parent ids on the page, in page order.
    pub ids: Vec<RecordId>,
    /// Valid child ids per child field.
    pub child_ids: Vec<(String, Vec<RecordId>)>,
}

/// Chooses insert, update or skip.
///
/// `cursor` is the checkpoint of an incremental run and 0 for a full run.
pub fn decide(
    entity: &EntityType,
    cursor: i64,
    record: &Record,
    stored: Option<&StoredState>,
) -> Decision {
    let Some(stored) = stored else {
        return Decision::Insert;
    };

    let incoming = record.updated_at();
    match entity.change_detection {
        ChangeDetection::UpdatedAt => {
            if incoming > stored.updated_at && incoming > cursor {
                Decision::Update
            } else {
                Decision::Skip
            }
        }
        ChangeDetection::ContentHash => {
            let digest = record.content_digest();
            if stored.content_hash.as_deref() != Some(digest.as_str())
                && incoming >= stored.updated_at
            {
                Decision::Update
            } else {
                Decision::Skip
            }
        }
        ChangeDetection::InsertOnly => Decision::Skip,
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Writes pages into descriptor-driven tables.
#[derive(Debug, Clone)]
pub struct Reconciler {
    records: RecordRepository,
}

impl Reconciler {
    pub fn new(records: RecordRepository) -> Self {
        Reconciler { records }
    }

    /// Reconciles one page of raw records.
    ///
    /// ## Errors
    /// Only storage failures; bad records are counted as rejected. On error
    /// nothing from the page is kept.
    pub async fn reconcile(
        &self,
        entity: &EntityType,
        cursor: i64,
        batch: &[Value],
    ) -> SyncResult<PageOutcome> {
        let mut tx = self.records.begin_page().await?;
        let mut outcome = PageOutcome::default();
        let mut parents = Vec::with_capacity(batch.len());

        for raw in batch {
            let Some((id, record)) = parse(entity, raw) else {
                outcome.counts.rejected += 1;
                continue;
            };

            apply(&mut tx, entity, cursor, id, &record, &mut outcome.counts).await?;
            outcome.ids.push(id);
            parents.push((id, record));
        }

        for child in &entity.children {
            let mut child_ids = Vec::new();

            for (parent_id, parent) in &parents {
                for raw in parent.children(&child.field) {
                    let Some((id, mut record)) = parse(&child.entity, raw) else {
                        outcome.child_counts.rejected += 1;
                        continue;
                    };
                    record.set(child.parent_column.clone(), Value::from(*parent_id));

                    apply(
                        &mut tx,
                        &child.entity,
                        cursor,
                        id,
                        &record,
                        &mut outcome.child_counts,
                    )
                    .await?;
                    child_ids.push(id);
                }
            }

            outcome.child_ids.push((child.field.clone(), child_ids));
        }

        tx.commit().await?;

        debug!(
            entity = %entity.name,
            added = outcome.counts.added,
            updated = outcome.counts.updated,
            skipped = outcome.counts.skipped,
            rejected = outcome.counts.rejected,
            "Page reconciled"
        );
        Ok(outcome)
    }
}

/// Turns raw JSON into a record with a usable id, or logs why not.
fn parse(entity: &EntityType, raw: &Value) -> Option<(RecordId, Record)> {
    let record = match Record::from_value(raw.clone()) {
        Ok(record) => record,
        Err(e) => {
            warn!(entity = %entity.name, error = %e, "Rejected record");
            return None;
        }
    };

    match record.id() {
        Ok(id) => Some((id, record)),
        Err(e) => {
            warn!(entity = %entity.name, error = %e, "Rejected record");
            None
        }
    }
}

async fn apply(
    tx: &mut PageTransaction,
    entity: &EntityType,
    cursor: i64,
    id: RecordId,
    record: &Record,
    counts: &mut ReconcileCounts,
) -> SyncResult<()> {
    let stored = tx.stored_state(entity, id).await?;

    match decide(entity, cursor, record, stored.as_ref()) {
        Decision::Insert => {
            tx.insert(entity, id, &entity.row_values(record)).await?;
            counts.added += 1;
            debug!(entity = %entity.name, id, "Inserted");
        }
        Decision::Update => {
            // The UPDATE re-checks updated_at itself.
            if tx.update(entity, id, &entity.row_values(record)).await? {
                counts.updated += 1;
                debug!(entity = %entity.name, id, "Updated");
            } else {
                counts.skipped += 1;
            }
        }
        Decision::Skip => counts.skipped += 1,
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{catalog, ColumnSpec};
    use mirror_db::{Database, DbConfig};
    use serde_json::json;

    fn widgets() -> EntityType {
        EntityType::new("widgets")
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::timestamp("updated_at"))
    }

    async fn setup(entity: &EntityType) -> (Database, Reconciler) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.ensure_entity_tables(std::slice::from_ref(entity)).await.unwrap();
        let reconciler = Reconciler::new(db.records());
        (db, reconciler)
    }

    async fn stored_name(db: &Database, id: i64) -> String {
        sqlx::query_scalar("SELECT name FROM widgets WHERE id = ?1")
            .bind(id)
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let entity = widgets();
        let (_db, reconciler) = setup(&entity).await;
        let batch = vec![
            json!({"id": 1, "name": "a", "updated_at": "2024-05-01T10:00:00Z"}),
            json!({"id": 2, "name": "b", "updated_at": "2024-05-02T10:00:00Z"}),
        ];

        let first = reconciler.reconcile(&entity, 0, &batch).await.unwrap();
        assert_eq!(first.counts.added, 2);
        assert_eq!(first.ids, vec![1, 2]);

        let replay = reconciler.reconcile(&entity, 0, &batch).await.unwrap();
        assert_eq!(replay.counts.added, 0);
        assert_eq!(replay.counts.updated, 0);
        assert_eq!(replay.counts.skipped, 2);
    }

    #[tokio::test]
    async fn test_never_overwrites_with_older_version() {
        let entity = widgets();
        let (db, reconciler) = setup(&entity).await;

        let newer = vec![json!({"id": 7, "name": "new", "updated_at": "2024-05-02T00:00:00Z"})];
        let older = vec![json!({"id": 7, "name": "old", "updated_at": "2024-05-01T00:00:00Z"})];

        reconciler.reconcile(&entity, 0, &newer).await.unwrap();
        let outcome = reconciler.reconcile(&entity, 0, &older).await.unwrap();

        assert_eq!(outcome.counts.skipped, 1);
        assert_eq!(stored_name(&db, 7).await, "new");
    }

    #[tokio::test]
    async fn test_update_requires_change_after_cursor() {
        let entity = widgets();
        let (db, reconciler) = setup(&entity).await;

        let v1 = vec![json!({"id": 1, "name": "v1", "updated_at": "2024-05-01T00:00:00Z"})];
        let v2 = vec![json!({"id": 1, "name": "v2", "updated_at": "2024-05-02T00:00:00Z"})];
        reconciler.reconcile(&entity, 0, &v1).await.unwrap();

        // 2024-05-03: the change predates the last successful run
        let cursor = 1_714_694_400;
        let skipped = reconciler.reconcile(&entity, cursor, &v2).await.unwrap();
        assert_eq!(skipped.counts.skipped, 1);
        assert_eq!(stored_name(&db, 1).await, "v1");

        let updated = reconciler.reconcile(&entity, 0, &v2).await.unwrap();
        assert_eq!(updated.counts.updated, 1);
        assert_eq!(stored_name(&db, 1).await, "v2");
    }

    #[tokio::test]
    async fn test_bad_records_are_rejected_and_counted() {
        let entity = widgets();
        let (_db, reconciler) = setup(&entity).await;
        let batch = vec![
            json!({"name": "no id"}),
            json!({"id": -4, "name": "negative"}),
            json!({"id": "abc", "name": "string id"}),
            json!("not an object"),
            json!({"id": 3, "name": "fine"}),
        ];

        let outcome = reconciler.reconcile(&entity, 0, &batch).await.unwrap();
        assert_eq!(outcome.counts.rejected, 4);
        assert_eq!(outcome.counts.added, 1);
        assert_eq!(outcome.ids, vec![3]);
    }

    #[tokio::test]
    async fn test_content_hash_detects_changes() {
        let entity = catalog::products();
        let (db, reconciler) = setup(&entity).await;

        let v1 = vec![json!({"id": 10, "name": "Cable", "price_retail": "4.99"})];
        let same = vec![json!({"price_retail": "4.99", "name": "Cable", "id": 10})];
        let v2 = vec![json!({"id": 10, "name": "Cable", "price_retail": "5.49"})];

        assert_eq!(reconciler.reconcile(&entity, 0, &v1).await.unwrap().counts.added, 1);
        // key order does not change the digest
        assert_eq!(reconciler.reconcile(&entity, 0, &same).await.unwrap().counts.skipped, 1);
        assert_eq!(reconciler.reconcile(&entity, 0, &v2).await.unwrap().counts.updated, 1);

        let price: f64 = sqlx::query_scalar("SELECT price_retail FROM products WHERE id = 10")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!((price - 5.49).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_children_follow_parents() {
        let entity = catalog::tickets();
        let (db, reconciler) = setup(&entity).await;

        let batch = vec![json!({
            "id": 100,
            "number": 5001,
            "subject": "Screen repair (3)",
            "updated_at": "2024-05-01T10:00:00Z",
            "comments": [
                {"id": 900, "subject": "Intake", "body": "Dropped", "updated_at": "2024-05-01T10:00:00Z"},
                {"subject": "missing id"}
            ]
        })];

        let outcome = reconciler.reconcile(&entity, 0, &batch).await.unwrap();
        assert_eq!(outcome.counts.added, 1);
        assert_eq!(outcome.child_counts.added, 1);
        assert_eq!(outcome.child_counts.rejected, 1);
        assert_eq!(outcome.child_ids, vec![("comments".to_string(), vec![900])]);

        let ticket_id: i64 = sqlx::query_scalar("SELECT ticket_id FROM comments WHERE id = 900")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(ticket_id, 100);
    }

    #[test]
    fn test_decide_without_stored_row_inserts() {
        let record = Record::from_value(json!({"id": 1})).unwrap();
        assert_eq!(decide(&widgets(), 0, &record, None), Decision::Insert);
    }

    #[test]
    fn test_decide_hash_refuses_older_version() {
        let entity = widgets().change_detection(ChangeDetection::ContentHash);
        let record =
            Record::from_value(json!({"id": 1, "updated_at": "2024-05-01T00:00:00Z"})).unwrap();
        let stored = StoredState {
            updated_at: record.updated_at() + 60,
            content_hash: Some("different".into()),
        };
        assert_eq!(decide(&entity, 0, &record, Some(&stored)), Decision::Skip);
    }
}
