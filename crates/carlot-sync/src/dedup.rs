//! Dedup/upsert engine: resolves identity and fingerprint for each candidate and hands
//! the decision (insert / update / heartbeat) to the store's atomic upsert.

use std::sync::Arc;

use carlot_adapters::canonical_source_key;
use carlot_core::{CandidateRecord, ValidationError};
use carlot_storage::{ListingStore, StoreError, UpsertOutcome, UpsertRow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2100;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("rejected candidate {source_key:?}: {source}")]
    Validation {
        source_key: String,
        #[source]
        source: ValidationError,
    },
    #[error("store rejected {source_key:?}: {source}")]
    Store {
        source_key: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn source_key(&self) -> &str {
        match self {
            Self::Validation { source_key, .. } | Self::Store { source_key, .. } => source_key,
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_unavailable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Constraint,
    StoreUnavailable,
    Store,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub source_key: String,
    pub kind: FailureKind,
    pub message: String,
}

impl From<&IngestError> for RecordFailure {
    fn from(err: &IngestError) -> Self {
        let kind = match err {
            IngestError::Validation { .. } => FailureKind::Validation,
            IngestError::Store {
                source: StoreError::Constraint { .. },
                ..
            } => FailureKind::Constraint,
            IngestError::Store {
                source: StoreError::Unavailable(_),
                ..
            } => FailureKind::StoreUnavailable,
            IngestError::Store { .. } => FailureKind::Store,
        };
        Self {
            source_key: err.source_key().to_string(),
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub heartbeats: usize,
    pub failures: Vec<RecordFailure>,
    /// Candidates that failed only because the store was unreachable; safe to replay.
    #[serde(skip)]
    pub retryable: Vec<CandidateRecord>,
}

impl BatchReport {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted { .. } => self.inserted += 1,
            UpsertOutcome::Updated { .. } => self.updated += 1,
            UpsertOutcome::Heartbeat { .. } => self.heartbeats += 1,
        }
    }
}

/// SHA-256 over the mutable attributes, unit-separator framed so field boundaries
/// cannot alias (`"ab" + "c"` vs `"a" + "bc"`).
pub fn content_hash(candidate: &CandidateRecord) -> String {
    let year = candidate.year.to_string();
    let price = candidate.price.to_string();
    let mut hasher = Sha256::new();
    for part in [
        candidate.brand.as_str(),
        candidate.model.as_str(),
        year.as_str(),
        price.as_str(),
        candidate.color.as_str(),
        candidate.link.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn ListingStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    /// Validate a candidate and resolve its identity and fingerprint.
    pub fn prepare(
        candidate: &CandidateRecord,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertRow, IngestError> {
        let reject = |source: ValidationError| IngestError::Validation {
            source_key: candidate.source_key.clone(),
            source,
        };

        let source_key = canonical_source_key(&candidate.source_key)
            .ok_or_else(|| reject(ValidationError::Blank { field: "sourceKey" }))?;
        for (field, value) in [
            ("brand", &candidate.brand),
            ("model", &candidate.model),
            ("color", &candidate.color),
            ("link", &candidate.link),
        ] {
            if value.trim().is_empty() {
                return Err(reject(ValidationError::Blank { field }));
            }
        }
        if candidate.price < 0 {
            return Err(reject(ValidationError::Negative { field: "price" }));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&candidate.year) {
            return Err(reject(ValidationError::OutOfRange {
                field: "year",
                value: candidate.year.into(),
                min: MIN_YEAR.into(),
                max: MAX_YEAR.into(),
            }));
        }

        // Fingerprint what is stored, not what was scraped.
        let stored = CandidateRecord {
            source_key,
            brand: candidate.brand.trim().to_string(),
            model: candidate.model.trim().to_string(),
            year: candidate.year,
            price: candidate.price,
            color: candidate.color.trim().to_string(),
            link: candidate.link.trim().to_string(),
        };
        let content_hash = content_hash(&stored);

        Ok(UpsertRow {
            source_key: stored.source_key,
            brand: stored.brand,
            model: stored.model,
            year: stored.year,
            price: stored.price,
            color: stored.color,
            link: stored.link,
            content_hash,
            seen_at,
        })
    }

    pub async fn ingest(
        &self,
        candidate: &CandidateRecord,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, IngestError> {
        let row = Self::prepare(candidate, seen_at)?;
        self.store
            .upsert(&row)
            .await
            .map_err(|source| IngestError::Store {
                source_key: row.source_key.clone(),
                source,
            })
    }

    /// Upsert every candidate independently; one failure never aborts the batch.
    pub async fn ingest_batch(
        &self,
        candidates: &[CandidateRecord],
        seen_at: DateTime<Utc>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for candidate in candidates {
            match self.ingest(candidate, seen_at).await {
                Ok(outcome) => {
                    debug!(id = outcome.id(), ?outcome, "listing ingested");
                    report.record(outcome);
                }
                Err(err) => {
                    warn!(source_key = err.source_key(), error = %err, "listing not ingested");
                    if err.is_store_unavailable() {
                        report.retryable.push(candidate.clone());
                    }
                    report.failures.push(RecordFailure::from(&err));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carlot_storage::MemoryListingStore;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).single().unwrap() + Duration::minutes(minutes)
    }

    fn candidate(id: &str, price: i64) -> CandidateRecord {
        let link = format!("https://www.carsensor.net/usedcar/detail/{id}/index.html");
        CandidateRecord {
            source_key: link.clone(),
            brand: "Toyota".into(),
            model: "Prius".into(),
            year: 2019,
            price,
            color: "White".into(),
            link,
        }
    }

    fn engine() -> (Arc<MemoryListingStore>, UpsertEngine) {
        let store = Arc::new(MemoryListingStore::new());
        (store.clone(), UpsertEngine::new(store))
    }

    #[test]
    fn hash_changes_iff_a_mutable_attribute_changes() {
        let base = candidate("AU1", 1_000_000);
        let mut same = base.clone();
        same.source_key = "https://www.carsensor.net/usedcar/detail/AU1/index.html?x=1".into();
        assert_eq!(content_hash(&base), content_hash(&same));

        let mut cheaper = base.clone();
        cheaper.price = 900_000;
        assert_ne!(content_hash(&base), content_hash(&cheaper));

        let mut a = base.clone();
        a.brand = "ab".into();
        a.model = "c".into();
        let mut b = base.clone();
        b.brand = "a".into();
        b.model = "bc".into();
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[tokio::test]
    async fn replaying_the_same_candidate_keeps_one_row() {
        let (store, engine) = engine();
        let c = candidate("AU1", 1_000_000);
        for i in 0..5 {
            engine.ingest(&c, t(i)).await.unwrap();
        }
        assert_eq!(store.len().await, 1);
        let row = store.find_by_source_key(&c.source_key).await.unwrap().unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.first_seen_at, t(0));
        assert_eq!(row.last_seen_at, t(4));
    }

    #[tokio::test]
    async fn changed_price_updates_content_but_not_identity() {
        let (store, engine) = engine();
        let first = engine.ingest(&candidate("AU1", 1_000_000), t(0)).await.unwrap();
        engine.ingest(&candidate("AU2", 2_000_000), t(1)).await.unwrap();
        let second = engine.ingest(&candidate("AU1", 950_000), t(10)).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted { id: 1 });
        assert_eq!(second, UpsertOutcome::Updated { id: 1 });

        let key = candidate("AU1", 0).source_key;
        let row = store.find_by_source_key(&key).await.unwrap().unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.price, 950_000);
        assert_eq!(row.first_seen_at, t(0));
        assert_eq!(row.last_seen_at, t(10));
        assert_eq!(row.content_hash, content_hash(&candidate("AU1", 950_000)));
    }

    #[tokio::test]
    async fn unchanged_candidate_is_a_heartbeat() {
        let (store, engine) = engine();
        let c = candidate("AU1", 1_000_000);
        engine.ingest(&c, t(0)).await.unwrap();
        let before = store.find_by_source_key(&c.source_key).await.unwrap().unwrap();

        let outcome = engine.ingest(&c, t(30)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Heartbeat { id: before.id });

        let after = store.find_by_source_key(&c.source_key).await.unwrap().unwrap();
        assert_eq!(after.last_seen_at, t(30));
        assert_eq!(
            ListingRecordWithoutSeen::from(&after),
            ListingRecordWithoutSeen::from(&before)
        );
    }

    #[tokio::test]
    async fn invalid_candidates_fail_alone() {
        let (store, engine) = engine();
        let mut negative = candidate("AU2", 1);
        negative.price = -5;
        let mut keyless = candidate("AU3", 1);
        keyless.source_key = "  ".into();

        let report = engine
            .ingest_batch(&[candidate("AU1", 1), negative, keyless, candidate("AU4", 1)], t(0))
            .await;
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.kind == FailureKind::Validation));
        assert!(report.retryable.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn racing_ingests_of_one_key_create_one_row() {
        let (store, engine) = engine();
        let mut handles = Vec::new();
        for i in 0..16 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.ingest(&candidate("AU1", 1_000_000), t(i)).await
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), UpsertOutcome::Inserted { .. }) {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[derive(Debug, PartialEq)]
    struct ListingRecordWithoutSeen {
        id: i64,
        source_key: String,
        brand: String,
        model: String,
        year: i32,
        price: i64,
        color: String,
        link: String,
        content_hash: String,
        first_seen_at: DateTime<Utc>,
    }

    impl From<&carlot_core::ListingRecord> for ListingRecordWithoutSeen {
        fn from(r: &carlot_core::ListingRecord) -> Self {
            Self {
                id: r.id,
                source_key: r.source_key.clone(),
                brand: r.brand.clone(),
                model: r.model.clone(),
                year: r.year,
                price: r.price,
                color: r.color.clone(),
                link: r.link.clone(),
                content_hash: r.content_hash.clone(),
                first_seen_at: r.first_seen_at,
            }
        }
    }
}
