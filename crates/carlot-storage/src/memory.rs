//! In-process [`ListingStore`] with the same atomic upsert and ordering contract as the
//! Postgres store. Backs tests and `carlot-cli serve --memory`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use carlot_core::{ListingQuery, ListingRecord};
use tokio::sync::Mutex;

use crate::store::{ListingStore, StoreError, UpsertOutcome, UpsertRow};

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    last_id: i64,
    rows: BTreeMap<i64, ListingRecord>,
    by_key: HashMap<String, i64>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert(&self, row: &UpsertRow) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(&id) = inner.by_key.get(&row.source_key) {
            let existing = inner
                .rows
                .get_mut(&id)
                .ok_or_else(|| StoreError::Backend(format!("index points at missing row {id}")))?;
            existing.last_seen_at = existing.last_seen_at.max(row.seen_at);
            if existing.content_hash == row.content_hash {
                return Ok(UpsertOutcome::Heartbeat { id });
            }
            existing.brand = row.brand.clone();
            existing.model = row.model.clone();
            existing.year = row.year;
            existing.price = row.price;
            existing.color = row.color.clone();
            existing.link = row.link.clone();
            existing.content_hash = row.content_hash.clone();
            return Ok(UpsertOutcome::Updated { id });
        }

        inner.last_id += 1;
        let id = inner.last_id;
        inner.by_key.insert(row.source_key.clone(), id);
        inner.rows.insert(
            id,
            ListingRecord {
                id,
                source_key: row.source_key.clone(),
                brand: row.brand.clone(),
                model: row.model.clone(),
                year: row.year,
                price: row.price,
                color: row.color.clone(),
                link: row.link.clone(),
                content_hash: row.content_hash.clone(),
                first_seen_at: row.seen_at,
                last_seen_at: row.seen_at,
            },
        );
        Ok(UpsertOutcome::Inserted { id })
    }

    async fn fetch_page(
        &self,
        query: &ListingQuery,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let upper = before.unwrap_or(i64::MAX);
        Ok(inner
            .rows
            .range(..upper)
            .rev()
            .map(|(_, record)| record)
            .filter(|record| query.matches(record))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, query: &ListingQuery) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().filter(|r| query.matches(r)).count() as u64)
    }

    async fn find_by_source_key(
        &self,
        source_key: &str,
    ) -> Result<Option<ListingRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_key
            .get(source_key)
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }
}
