//! # Record Repository
//!
//! Descriptor-driven access to live and tombstone tables.
//!
//! Every statement here is built at runtime from an [`EntityType`], so the
//! same code serves tickets, invoices or any future collection. Identifiers
//! are validated before interpolation; values always go through binds.
//!
//! ## Tables per Entity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  tickets                        deleted_tickets                         │
//! │  ┌────┬─────────┬──────────┐    ┌────┬─────────┬──────────┐            │
//! │  │ id │ subject │updated_at│ ─► │ id │ subject │updated_at│  archive   │
//! │  └────┴─────────┴──────────┘    └────┴─────────┴──────────┘            │
//! │     ▲ FOREIGN KEY                                                       │
//! │  comments                       deleted_comments                        │
//! │  ┌────┬───────────┬──────┐      ┌────┬───────────┬──────┐              │
//! │  │ id │ ticket_id │ body │ ───► │ id │ ticket_id │ body │  archive     │
//! │  └────┴───────────┴──────┘      └────┴───────────┴──────┘              │
//! │                                                                         │
//! │  Tombstones have identical columns, so archiving is                    │
//! │  INSERT OR REPLACE INTO deleted_x SELECT * FROM x WHERE id = ?         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::{SqlitePool, Transaction};
use tracing::debug;

use mirror_core::entity::{ChangeDetection, EntityType, CONTENT_HASH_COLUMN, UPDATED_AT_COLUMN};
use mirror_core::transform::{self, SqlValue};
use mirror_core::validation::validate_entity;
use mirror_core::RecordId;

use crate::error::{DbError, DbResult};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

// =============================================================================
// Types
// =============================================================================

/// What the reconciler needs to know about an already stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    /// Stored `updated_at` as UNIX seconds (0 when absent).
    pub updated_at: i64,
    /// Stored digest for hash-detected entities.
    pub content_hash: Option<String>,
}

/// `COUNT(id)` and `SUM(id)` of a table, for the cheap deletion pre-check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdAggregate {
    pub count: u64,
    pub sum: i64,
}

impl IdAggregate {
    /// Aggregates an id population held in memory.
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a RecordId>) -> Self {
        ids.into_iter().fold(IdAggregate::default(), |acc, id| IdAggregate {
            count: acc.count + 1,
            sum: acc.sum.wrapping_add(*id),
        })
    }
}

// =============================================================================
// Record Repository
// =============================================================================

/// Repository for descriptor-driven tables.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Creates the live table, the tombstone table and all child tables.
    ///
    /// Uses `CREATE TABLE IF NOT EXISTS`, so it is safe on every startup.
    pub async fn ensure_tables(&self, entity: &EntityType) -> DbResult<()> {
        validate_entity(entity)?;

        sqlx::query(&create_table_sql(entity, &entity.table, None))
            .execute(&self.pool)
            .await?;
        if let Some(tombstone) = &entity.tombstone_table {
            sqlx::query(&create_table_sql(entity, tombstone, None))
                .execute(&self.pool)
                .await?;
        }

        for child in &entity.children {
            let fk = Some((child.parent_column.as_str(), entity.table.as_str()));
            sqlx::query(&create_table_sql(&child.entity, &child.entity.table, fk))
                .execute(&self.pool)
                .await?;
            if let Some(tombstone) = &child.entity.tombstone_table {
                sqlx::query(&create_table_sql(&child.entity, tombstone, None))
                    .execute(&self.pool)
                    .await?;
            }
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("idx_{}_{}", child.entity.table, child.parent_column)),
                quote(&child.entity.table),
                quote(&child.parent_column),
            ))
            .execute(&self.pool)
            .await?;
        }

        debug!(entity = %entity.name, table = %entity.table, "Tables ensured");
        Ok(())
    }

    /// Starts the transaction one page of records is written in.
    pub async fn begin_page(&self) -> DbResult<PageTransaction> {
        Ok(PageTransaction {
            tx: self.pool.begin().await?,
        })
    }

    /// Stored state of one row, outside any page transaction.
    pub async fn stored_state(
        &self,
        entity: &EntityType,
        id: RecordId,
    ) -> DbResult<Option<StoredState>> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<(Option<String>, Option<String>)> =
            sqlx::query_as(&stored_state_sql(entity))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.map(into_stored_state))
    }

    /// All live ids, ascending.
    pub async fn ids(&self, entity: &EntityType) -> DbResult<Vec<RecordId>> {
        self.ids_in(&entity.table).await
    }

    /// All archived ids, ascending.
    pub async fn tombstone_ids(&self, entity: &EntityType) -> DbResult<Vec<RecordId>> {
        match &entity.tombstone_table {
            Some(tombstone) => self.ids_in(tombstone).await,
            None => Ok(Vec::new()),
        }
    }

    async fn ids_in(&self, table: &str) -> DbResult<Vec<RecordId>> {
        let ids = sqlx::query_scalar(&format!("SELECT id FROM {} ORDER BY id", quote(table)))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// `COUNT(id)` / `SUM(id)` of the live table.
    pub async fn id_aggregate(&self, entity: &EntityType) -> DbResult<IdAggregate> {
        let (count, sum): (i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(id), COALESCE(SUM(id), 0) FROM {}",
            quote(&entity.table)
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(IdAggregate {
            count: count as u64,
            sum,
        })
    }

    /// Number of live rows.
    pub async fn count(&self, entity: &EntityType) -> DbResult<u64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote(&entity.table)))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Moves one row (and its children) into the tombstone tables.
    ///
    /// ## Steps (one transaction)
    /// 1. Copy child rows into the child tombstone, delete them
    /// 2. Copy the row into the tombstone
    /// 3. Delete the row
    ///
    /// ## Returns
    /// Number of child rows archived alongside the row.
    ///
    /// ## Errors
    /// * `DbError::NotFound` - the row is no longer in the live table
    pub async fn archive(&self, entity: &EntityType, id: RecordId) -> DbResult<u64> {
        let tombstone = entity.tombstone_table.as_deref().ok_or_else(|| {
            DbError::InvalidDescriptor(format!("{} has no tombstone table", entity.name))
        })?;

        let mut tx = self.pool.begin().await?;
        let mut children_archived = 0;

        for child in &entity.children {
            let child_table = quote(&child.entity.table);
            let parent_column = quote(&child.parent_column);

            if let Some(child_tombstone) = &child.entity.tombstone_table {
                let copied = sqlx::query(&format!(
                    "INSERT OR REPLACE INTO {} SELECT * FROM {} WHERE {} = ?1",
                    quote(child_tombstone),
                    child_table,
                    parent_column
                ))
                .bind(id)
                .execute(&mut *tx)
                .await?;
                children_archived += copied.rows_affected();
            }

            sqlx::query(&format!(
                "DELETE FROM {} WHERE {} = ?1",
                child_table, parent_column
            ))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} SELECT * FROM {} WHERE id = ?1",
            quote(tombstone),
            quote(&entity.table)
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", quote(&entity.table)))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            // Dropping the transaction rolls back the child moves.
            return Err(DbError::not_found(&entity.table, id));
        }

        tx.commit().await?;

        debug!(entity = %entity.name, id, children_archived, "Archived row");
        Ok(children_archived)
    }
}

// =============================================================================
// Page Transaction
// =============================================================================

/// The transaction one fetched page is reconciled in.
///
/// Dropping it without [`commit`](Self::commit) rolls every write back.
pub struct PageTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl PageTransaction {
    /// Stored `updated_at` / digest for `id`, or `None` if absent.
    pub async fn stored_state(
        &mut self,
        entity: &EntityType,
        id: RecordId,
    ) -> DbResult<Option<StoredState>> {
        let row: Option<(Option<String>, Option<String>)> =
            sqlx::query_as(&stored_state_sql(entity))
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(into_stored_state))
    }

    /// Inserts a new row. `values` follow `entity.column_names()`.
    pub async fn insert(
        &mut self,
        entity: &EntityType,
        id: RecordId,
        values: &[SqlValue],
    ) -> DbResult<()> {
        let columns = entity.column_names();
        let column_list = std::iter::once("id")
            .chain(columns.iter().copied())
            .map(quote)
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len() + 1].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&entity.table),
            column_list,
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(id);
        for value in values {
            query = bind_value(query, value);
        }
        query.execute(&mut *self.tx).await?;
        Ok(())
    }

    /// Overwrites every mapped column of an existing row.
    ///
    /// For `updated_at` entities the statement carries its own guard, so a
    /// row is never replaced by an older version even if the caller's view
    /// was stale.
    ///
    /// ## Returns
    /// `true` if the row was changed.
    pub async fn update(
        &mut self,
        entity: &EntityType,
        id: RecordId,
        values: &[SqlValue],
    ) -> DbResult<bool> {
        let columns = entity.column_names();
        let assignments = columns
            .iter()
            .map(|c| format!("{} = ?", quote(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let guarded_at = match entity.change_detection {
            ChangeDetection::UpdatedAt => columns
                .iter()
                .position(|c| *c == UPDATED_AT_COLUMN)
                .and_then(|i| values.get(i)),
            ChangeDetection::ContentHash | ChangeDetection::InsertOnly => None,
        };

        let mut sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            quote(&entity.table),
            assignments
        );
        if guarded_at.is_some() {
            sql.push_str(&format!(
                " AND ({col} IS NULL OR {col} < ?)",
                col = quote(UPDATED_AT_COLUMN)
            ));
        }

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }
        query = query.bind(id);
        if let Some(updated_at) = guarded_at {
            query = bind_value(query, updated_at);
        }

        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Commits every write made for the page.
    pub async fn commit(self) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// SQL Helpers
// =============================================================================

/// Double-quotes a validated identifier.
fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

fn create_table_sql(entity: &EntityType, table: &str, fk: Option<(&str, &str)>) -> String {
    let mut defs = vec![format!("{} INTEGER PRIMARY KEY NOT NULL", quote("id"))];
    for column in &entity.columns {
        defs.push(format!("{} {}", quote(&column.name), column.kind.sql_type()));
    }
    if entity.uses_content_hash() {
        defs.push(format!("{} TEXT", quote(CONTENT_HASH_COLUMN)));
    }
    if let Some((column, parent_table)) = fk {
        defs.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            quote(column),
            quote(parent_table),
            quote("id")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(table),
        defs.join(",\n    ")
    )
}

fn stored_state_sql(entity: &EntityType) -> String {
    let updated_at = if entity.has_updated_at() {
        quote(UPDATED_AT_COLUMN)
    } else {
        "NULL".to_string()
    };
    let hash = if entity.uses_content_hash() {
        quote(CONTENT_HASH_COLUMN)
    } else {
        "NULL".to_string()
    };
    format!(
        "SELECT {}, {} FROM {} WHERE id = ?1",
        updated_at,
        hash,
        quote(&entity.table)
    )
}

fn into_stored_state((updated_at, content_hash): (Option<String>, Option<String>)) -> StoredState {
    StoredState {
        updated_at: updated_at
            .as_deref()
            .and_then(transform::parse_timestamp)
            .map(|ts| ts.timestamp())
            .unwrap_or(0),
        content_hash,
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Boolean(v) => query.bind(*v),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use mirror_core::catalog;
    use mirror_core::entity::ColumnSpec;
    use mirror_core::Record;
    use serde_json::json;

    fn widgets() -> EntityType {
        EntityType::new("widgets")
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::timestamp("updated_at"))
    }

    async fn setup(entity: &EntityType) -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.records().ensure_tables(entity).await.unwrap();
        db
    }

    async fn put(db: &Database, entity: &EntityType, value: serde_json::Value) {
        let record = Record::from_value(value).unwrap();
        let mut page = db.records().begin_page().await.unwrap();
        page.insert(entity, record.id().unwrap(), &entity.row_values(&record))
            .await
            .unwrap();
        page.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_stored_state() {
        let widgets = widgets();
        let db = setup(&widgets).await;
        put(&db, &widgets, json!({"id": 1, "name": "a", "updated_at": "1970-01-01T00:01:40Z"})).await;

        let state = db.records().stored_state(&widgets, 1).await.unwrap().unwrap();
        assert_eq!(state.updated_at, 100);
        assert_eq!(state.content_hash, None);
        assert!(db.records().stored_state(&widgets, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_guard_refuses_older_version() {
        let widgets = widgets();
        let db = setup(&widgets).await;
        put(&db, &widgets, json!({"id": 1, "name": "new", "updated_at": "2024-01-02T00:00:00Z"})).await;

        let older = Record::from_value(
            json!({"id": 1, "name": "old", "updated_at": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        let mut page = db.records().begin_page().await.unwrap();
        let changed = page
            .update(&widgets, 1, &widgets.row_values(&older))
            .await
            .unwrap();
        page.commit().await.unwrap();

        assert!(!changed);
        let name: String = sqlx::query_scalar("SELECT name FROM widgets WHERE id = 1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(name, "new");
    }

    #[tokio::test]
    async fn test_uncommitted_page_rolls_back() {
        let widgets = widgets();
        let db = setup(&widgets).await;
        {
            let record = Record::from_value(json!({"id": 7, "name": "x"})).unwrap();
            let mut page = db.records().begin_page().await.unwrap();
            page.insert(&widgets, 7, &widgets.row_values(&record))
                .await
                .unwrap();
        }
        assert_eq!(db.records().count(&widgets).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_and_archive() {
        let widgets = widgets();
        let db = setup(&widgets).await;
        for id in [1, 2, 3, 4] {
            put(&db, &widgets, json!({"id": id, "name": format!("w{}", id)})).await;
        }

        let repo = db.records();
        assert_eq!(
            repo.id_aggregate(&widgets).await.unwrap(),
            IdAggregate { count: 4, sum: 10 }
        );
        assert_eq!(IdAggregate::of(&[1, 2, 4]), IdAggregate { count: 3, sum: 7 });

        repo.archive(&widgets, 3).await.unwrap();
        assert_eq!(repo.ids(&widgets).await.unwrap(), vec![1, 2, 4]);
        assert_eq!(repo.tombstone_ids(&widgets).await.unwrap(), vec![3]);

        let archived_name: String =
            sqlx::query_scalar("SELECT name FROM deleted_widgets WHERE id = 3")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(archived_name, "w3");

        assert!(matches!(
            repo.archive(&widgets, 3).await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_archive_cascades_to_children() {
        let tickets = catalog::tickets();
        let comments = &tickets.children[0].entity;
        let db = setup(&tickets).await;

        put(&db, &tickets, json!({"id": 10, "subject": "Laptop (2)"})).await;
        put(&db, comments, json!({"id": 100, "ticket_id": 10, "body": "hi"})).await;
        put(&db, comments, json!({"id": 101, "ticket_id": 10, "body": "bye"})).await;

        let children = db.records().archive(&tickets, 10).await.unwrap();
        assert_eq!(children, 2);
        assert!(db.records().ids(comments).await.unwrap().is_empty());
        assert_eq!(
            db.records().tombstone_ids(comments).await.unwrap(),
            vec![100, 101]
        );
        assert_eq!(db.records().tombstone_ids(&tickets).await.unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn test_child_requires_parent() {
        let tickets = catalog::tickets();
        let comments = &tickets.children[0].entity;
        let db = setup(&tickets).await;

        let orphan = Record::from_value(json!({"id": 5, "ticket_id": 999})).unwrap();
        let mut page = db.records().begin_page().await.unwrap();
        let err = page
            .insert(comments, 5, &comments.row_values(&orphan))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation(_)));
    }
}
