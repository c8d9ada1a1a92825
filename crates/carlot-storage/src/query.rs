//! Cursor query engine: newest-first, id-anchored pagination over a [`ListingStore`].
//!
//! Pages are anchored on the immutable `id` ordering (`id < cursor ORDER BY id DESC`)
//! rather than row offsets, so rows inserted while a caller is paging land above the
//! consumed boundary and never shift later pages. `total` comes from a separate count
//! and may be momentarily stale under concurrent writes.

use std::sync::Arc;

use carlot_core::{ListingFilter, ListingQuery, Page, ValidationError};
use thiserror::Error;
use tracing::debug;

use crate::store::{ListingStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
        }
    }
}

impl QueryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_limit = std::env::var("CARLOT_MAX_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_limit)
            .max(1);
        let default_limit = std::env::var("CARLOT_DEFAULT_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.default_limit)
            .clamp(1, max_limit);
        Self {
            default_limit,
            max_limit,
        }
    }

    /// Requested limits are clamped into `1..=max_limit`, never rejected.
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct CursorQueryEngine {
    store: Arc<dyn ListingStore>,
    config: QueryConfig,
}

impl CursorQueryEngine {
    pub fn new(store: Arc<dyn ListingStore>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> QueryConfig {
        self.config
    }

    /// Free-text retrieval: case-insensitive substring over brand, model and color.
    pub async fn search(
        &self,
        search: Option<&str>,
        cursor: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Page, QueryError> {
        self.page(&ListingQuery::search(search), cursor, limit).await
    }

    /// Structured retrieval. The filter is validated before anything reaches the store.
    pub async fn filter(
        &self,
        filter: ListingFilter,
        cursor: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Page, QueryError> {
        let query = filter.into_query()?;
        self.page(&query, cursor, limit).await
    }

    pub async fn page(
        &self,
        query: &ListingQuery,
        cursor: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Page, QueryError> {
        if let Some(cursor) = cursor {
            if cursor <= 0 {
                return Err(ValidationError::InvalidCursor(cursor.to_string()).into());
            }
        }
        let limit = self.config.clamp_limit(limit);

        let items = self.store.fetch_page(query, cursor, limit).await?;
        let total = self.store.count(query).await?;

        let next_cursor = if items.len() == limit {
            items.last().map(|r| r.id)
        } else {
            None
        };
        debug!(?cursor, limit, returned = items.len(), total, ?next_cursor, "served page");

        Ok(Page {
            items,
            next_cursor,
            total,
        })
    }
}
