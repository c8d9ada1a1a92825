use async_trait::async_trait;
use carlot_core::{ListingQuery, ListingRecord};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Fully-computed row handed to [`ListingStore::upsert`]: identity and fingerprint are
/// already resolved by the dedup engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertRow {
    pub source_key: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price: i64,
    pub color: String,
    pub link: String,
    pub content_hash: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting; a new id was drawn from the store sequence.
    Inserted { id: i64 },
    /// Content hash differed; mutable attributes and `last_seen_at` were rewritten.
    Updated { id: i64 },
    /// Content hash matched; only `last_seen_at` moved.
    Heartbeat { id: i64 },
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match *self {
            Self::Inserted { id } | Self::Updated { id } | Self::Heartbeat { id } => id,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation ({constraint}): {message}")]
    Constraint { constraint: String, message: String },
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable listing storage. Implementations must evaluate `upsert` atomically against
/// the `source_key` uniqueness constraint; callers never read-then-write.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn upsert(&self, row: &UpsertRow) -> Result<UpsertOutcome, StoreError>;

    /// Rows matching `query` with `id < before` (all rows when `before` is absent),
    /// ordered by decreasing id, at most `limit` of them.
    async fn fetch_page(
        &self,
        query: &ListingQuery,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, StoreError>;

    async fn count(&self, query: &ListingQuery) -> Result<u64, StoreError>;

    async fn find_by_source_key(&self, source_key: &str)
        -> Result<Option<ListingRecord>, StoreError>;
}
