//! Scripted page source for engine tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use mirror_core::{transform, ColumnSpec, EntityType};
use mirror_db::{Database, DbConfig};

use crate::error::{SyncError, SyncResult};
use crate::source::{Page, PageFilter, PageSource};

/// Serves fixed pages and remembers every request.
pub(crate) struct ScriptedSource {
    pages: Vec<Vec<Value>>,
    total_entries: Option<u64>,
    failures: HashMap<u32, fn() -> SyncError>,
    delay: Option<Duration>,
    panics_for: HashSet<String>,
    calls: Mutex<Vec<(String, u32, Option<PageFilter>)>>,
}

impl ScriptedSource {
    /// `pages[0]` is page 1.
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        ScriptedSource {
            pages,
            total_entries: None,
            failures: HashMap::new(),
            delay: None,
            panics_for: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(mut self, page: u32, error: fn() -> SyncError) -> Self {
        self.failures.insert(page, error);
        self
    }

    /// Reports `total` instead of the real record count.
    pub fn with_total_entries(mut self, total: u64) -> Self {
        self.total_entries = Some(total);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panics instead of answering for `entity`.
    pub fn panicking_for(mut self, entity: &str) -> Self {
        self.panics_for.insert(entity.to_string());
        self
    }

    /// Page numbers requested, in order.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(_, page, _)| *page).collect()
    }

    /// Page numbers requested for one entity.
    pub fn calls_for(&self, entity: &str) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == entity)
            .map(|(_, page, _)| *page)
            .collect()
    }

    pub fn filters(&self) -> Vec<Option<PageFilter>> {
        self.calls.lock().unwrap().iter().map(|(_, _, f)| f.clone()).collect()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(
        &self,
        entity: &EntityType,
        page: u32,
        filter: Option<&PageFilter>,
    ) -> SyncResult<Page> {
        self.calls
            .lock()
            .unwrap()
            .push((entity.name.clone(), page, filter.cloned()));

        if self.panics_for.contains(&entity.name) {
            panic!("{} source blew up", entity.name);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.get(&page) {
            return Err(error());
        }

        let total_entries = self
            .total_entries
            .unwrap_or_else(|| self.pages.iter().map(|p| p.len() as u64).sum());

        Ok(Page {
            number: page,
            records: (page as usize)
                .checked_sub(1)
                .and_then(|i| self.pages.get(i))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|record| entity.shape(record))
                .collect(),
            total_pages: self.pages.len() as u32,
            total_entries,
        })
    }
}

pub(crate) fn widgets() -> EntityType {
    EntityType::new("widgets")
        .column(ColumnSpec::text("name"))
        .column(ColumnSpec::timestamp("updated_at"))
}

pub(crate) fn widget(id: i64, updated_at: i64) -> Value {
    json!({
        "id": id,
        "name": format!("widget {}", id),
        "updated_at": transform::format_unix(updated_at),
    })
}

pub(crate) async fn database(entities: &[EntityType]) -> Database {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    db.ensure_entity_tables(entities).await.unwrap();
    db
}
