//! Extraction worker: walks listing pages lazily, parses them, and flushes candidates
//! into the dedup engine in small batches.
//!
//! A run ends when the source runs dry, a page/record budget is hit, the wall-clock
//! budget elapses, it is cancelled, or the store stays unreachable past its outage
//! budget. Every ending produces a [`RunSummary`] with a resume point.

use std::sync::Arc;
use std::time::Duration;

use carlot_adapters::ListingSource;
use carlot_core::CandidateRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{BatchReport, FailureKind, RecordFailure, UpsertEngine};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub start_page: u32,
    pub max_pages: u32,
    pub max_records: usize,
    pub batch_size: usize,
    pub run_budget: Duration,
    pub store_outage_budget: Duration,
    pub store_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: 10,
            max_records: 1_000,
            batch_size: 25,
            run_budget: Duration::from_secs(15 * 60),
            store_outage_budget: Duration::from_secs(60),
            store_retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The source returned a page with no listings.
    SourceExhausted,
    PageBudgetReached,
    RecordBudgetReached,
    TimeBudgetExhausted,
    Cancelled,
    /// The store stayed unreachable beyond the outage budget; the run was halted.
    StoreUnavailable,
}

impl RunStatus {
    pub fn is_partial(&self) -> bool {
        !matches!(self, Self::SourceExhausted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub pages_fetched: u32,
    pub pages_failed: u32,
    pub parse_errors: usize,
    pub records_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub heartbeats: usize,
    pub failures: Vec<RecordFailure>,
    /// Page to start from to continue this traversal; absent once the source is exhausted.
    pub next_page: Option<u32>,
}

impl RunSummary {
    fn absorb(&mut self, report: BatchReport) {
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.heartbeats += report.heartbeats;
        self.failures.extend(report.failures);
    }
}

enum FlushHalt {
    /// The store stayed unreachable beyond the outage budget.
    StoreOutage,
    /// The run budget ran out while waiting for the store to come back.
    Deadline,
}

pub struct ExtractionWorker {
    source: Arc<dyn ListingSource>,
    engine: UpsertEngine,
    config: WorkerConfig,
}

impl ExtractionWorker {
    pub fn new(source: Arc<dyn ListingSource>, engine: UpsertEngine, config: WorkerConfig) -> Self {
        Self {
            source,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn run(&self, cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("extraction_run", %run_id, source_id = self.source.source_id());
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, cancel: &CancellationToken) -> RunSummary {
        let cfg = &self.config;
        let deadline = Instant::now() + cfg.run_budget;
        let batch_size = cfg.batch_size.max(1);
        let mut summary = RunSummary {
            run_id,
            source_id: self.source.source_id().to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: RunStatus::SourceExhausted,
            pages_fetched: 0,
            pages_failed: 0,
            parse_errors: 0,
            records_seen: 0,
            inserted: 0,
            updated: 0,
            heartbeats: 0,
            failures: Vec::new(),
            next_page: None,
        };
        let mut outage_since: Option<Instant> = None;
        let mut page_no = cfg.start_page.max(1);
        let mut pages_visited = 0u32;

        info!(start_page = page_no, max_pages = cfg.max_pages, "extraction run started");

        let status = 'pages: loop {
            if cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }
            if Instant::now() >= deadline {
                break RunStatus::TimeBudgetExhausted;
            }
            if pages_visited >= cfg.max_pages {
                break RunStatus::PageBudgetReached;
            }
            if summary.records_seen >= cfg.max_records {
                break RunStatus::RecordBudgetReached;
            }

            pages_visited += 1;
            let fetched = match tokio::time::timeout_at(deadline, self.source.fetch_page(run_id, page_no)).await {
                Err(_elapsed) => break RunStatus::TimeBudgetExhausted,
                Ok(Err(err)) => {
                    warn!(page_no, error = %err, "page fetch failed, skipping");
                    summary.pages_failed += 1;
                    match page_no.checked_add(1) {
                        Some(next) => page_no = next,
                        None => break RunStatus::SourceExhausted,
                    }
                    continue;
                }
                Ok(Ok(page)) => page,
            };
            summary.pages_fetched += 1;

            let parsed = match self.source.parse_page(&fetched) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(page_no, error = %err, "page unparseable, skipping");
                    summary.parse_errors += 1;
                    match page_no.checked_add(1) {
                        Some(next) => page_no = next,
                        None => break RunStatus::SourceExhausted,
                    }
                    continue;
                }
            };
            if parsed.is_empty() {
                if page_no == 1 {
                    // A live search always lists something on its first page.
                    warn!(url = %fetched.url, "first page has no listing blocks; markup may have changed");
                    summary.parse_errors += 1;
                } else {
                    info!(page_no, "no listings on page; source exhausted");
                }
                break RunStatus::SourceExhausted;
            }

            let mut candidates: Vec<CandidateRecord> = Vec::with_capacity(parsed.len());
            for item in parsed {
                match item {
                    Ok(candidate) => candidates.push(candidate),
                    Err(err) => {
                        warn!(page_no, error = %err, "listing skipped");
                        summary.parse_errors += 1;
                    }
                }
            }

            let remaining = cfg.max_records - summary.records_seen;
            let truncated = candidates.len() > remaining;
            candidates.truncate(remaining);
            summary.records_seen += candidates.len();

            for batch in candidates.chunks(batch_size) {
                match self.flush(batch, &mut summary, &mut outage_since, deadline).await {
                    Ok(()) => {}
                    Err(FlushHalt::StoreOutage) => break 'pages RunStatus::StoreUnavailable,
                    Err(FlushHalt::Deadline) => break 'pages RunStatus::TimeBudgetExhausted,
                }
                if cancel.is_cancelled() {
                    break 'pages RunStatus::Cancelled;
                }
                if Instant::now() >= deadline {
                    break 'pages RunStatus::TimeBudgetExhausted;
                }
            }

            if truncated {
                break RunStatus::RecordBudgetReached;
            }
            match page_no.checked_add(1) {
                Some(next) => page_no = next,
                None => break RunStatus::SourceExhausted,
            }
        };

        summary.status = status;
        summary.next_page = (status != RunStatus::SourceExhausted).then_some(page_no);
        summary.finished_at = Utc::now();
        if status == RunStatus::StoreUnavailable {
            error!(
                alert = true,
                budget_secs = cfg.store_outage_budget.as_secs(),
                "store unreachable beyond outage budget; run halted"
            );
        } else {
            info!(
                ?status,
                pages = summary.pages_fetched,
                inserted = summary.inserted,
                updated = summary.updated,
                heartbeats = summary.heartbeats,
                failures = summary.failures.len(),
                "extraction run finished"
            );
        }
        summary
    }

    /// Upsert one batch. Records that failed only because the store was unreachable
    /// are replayed until they land or a budget runs out. Cancellation does not
    /// interrupt a flush.
    async fn flush(
        &self,
        batch: &[CandidateRecord],
        summary: &mut RunSummary,
        outage_since: &mut Option<Instant>,
        deadline: Instant,
    ) -> Result<(), FlushHalt> {
        let mut pending = batch.to_vec();
        loop {
            let mut report = self.engine.ingest_batch(&pending, Utc::now()).await;
            pending = std::mem::take(&mut report.retryable);
            // Unavailable records are replayed; they are only reported if the run gives up.
            report
                .failures
                .retain(|f| f.kind != FailureKind::StoreUnavailable);
            summary.absorb(report);

            if pending.is_empty() {
                *outage_since = None;
                return Ok(());
            }

            let since = *outage_since.get_or_insert_with(Instant::now);
            let halt = if since.elapsed() >= self.config.store_outage_budget {
                Some((FlushHalt::StoreOutage, "store unreachable beyond outage budget"))
            } else if Instant::now() + self.config.store_retry_delay >= deadline {
                Some((FlushHalt::Deadline, "store unreachable when the run budget ran out"))
            } else {
                None
            };
            if let Some((halt, message)) = halt {
                for candidate in &pending {
                    summary.failures.push(RecordFailure {
                        source_key: candidate.source_key.clone(),
                        kind: FailureKind::StoreUnavailable,
                        message: message.to_string(),
                    });
                }
                return Err(halt);
            }
            warn!(pending = pending.len(), "store unavailable, retrying batch");
            tokio::time::sleep(self.config.store_retry_delay).await;
        }
    }
}
