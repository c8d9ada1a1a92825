//! Postgres-backed [`ListingStore`].
//!
//! Identity is assigned by the `listings.id` identity sequence and deduplication is
//! decided by `INSERT ... ON CONFLICT (source_key)`, so concurrent workers need no
//! coordination beyond the database itself.

use std::time::Duration;

use async_trait::async_trait;
use carlot_core::{ColorMatch, ListingQuery, ListingRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::store::{ListingStore, StoreError, UpsertOutcome, UpsertRow};

const LISTING_COLUMNS: &str = "id, source_key, brand, model, year, price, color, link, \
                               content_hash, first_seen_at, last_seen_at";

const UPSERT_SQL: &str = r#"
    WITH prior AS (
        SELECT content_hash FROM listings WHERE source_key = $1
    )
    INSERT INTO listings AS l
        (source_key, brand, model, year, price, color, link, content_hash, first_seen_at, last_seen_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
    ON CONFLICT (source_key) DO UPDATE SET
        brand        = CASE WHEN l.content_hash = EXCLUDED.content_hash THEN l.brand ELSE EXCLUDED.brand END,
        model        = CASE WHEN l.content_hash = EXCLUDED.content_hash THEN l.model ELSE EXCLUDED.model END,
        year         = CASE WHEN l.content_hash = EXCLUDED.content_hash THEN l.year ELSE EXCLUDED.year END,
        price        = CASE WHEN l.content_hash = EXCLUDED.content_hash THEN l.price ELSE EXCLUDED.price END,
        color        = CASE WHEN l.content_hash = EXCLUDED.content_hash THEN l.color ELSE EXCLUDED.color END,
        link         = CASE WHEN l.content_hash = EXCLUDED.content_hash THEN l.link ELSE EXCLUDED.link END,
        content_hash = EXCLUDED.content_hash,
        last_seen_at = GREATEST(l.last_seen_at, EXCLUDED.last_seen_at)
    RETURNING l.id, (l.xmax = 0) AS inserted, (SELECT content_hash FROM prior) AS prior_hash
"#;

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("listings schema migrated");
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert(&self, row: &UpsertRow) -> Result<UpsertOutcome, StoreError> {
        let result = sqlx::query(UPSERT_SQL)
            .bind(&row.source_key)
            .bind(&row.brand)
            .bind(&row.model)
            .bind(row.year)
            .bind(row.price)
            .bind(&row.color)
            .bind(&row.link)
            .bind(&row.content_hash)
            .bind(row.seen_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let id: i64 = result.try_get("id").map_err(map_sqlx_error)?;
        let inserted: bool = result.try_get("inserted").map_err(map_sqlx_error)?;
        let prior_hash: Option<String> = result.try_get("prior_hash").map_err(map_sqlx_error)?;

        // A concurrent insert that committed after this statement's snapshot leaves
        // `prior_hash` empty on conflict; that is reported as an update.
        let outcome = if inserted {
            UpsertOutcome::Inserted { id }
        } else if prior_hash.as_deref() == Some(row.content_hash.as_str()) {
            UpsertOutcome::Heartbeat { id }
        } else {
            UpsertOutcome::Updated { id }
        };
        debug!(source_key = %row.source_key, ?outcome, "upserted listing");
        Ok(outcome)
    }

    async fn fetch_page(
        &self,
        query: &ListingQuery,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE TRUE"
        ));
        push_predicate(&mut qb, query);
        if let Some(before) = before {
            qb.push(" AND id < ").push_bind(before);
        }
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn count(&self, query: &ListingQuery) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM listings WHERE TRUE");
        push_predicate(&mut qb, query);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let total: i64 = row.try_get("total").map_err(map_sqlx_error)?;
        Ok(total.max(0) as u64)
    }

    async fn find_by_source_key(
        &self,
        source_key: &str,
    ) -> Result<Option<ListingRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE source_key = $1"
        ))
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(row_to_record).transpose()
    }
}

fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, query: &ListingQuery) {
    if let Some(term) = &query.search {
        let pattern = like_pattern(term);
        qb.push(" AND (brand ILIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR model ILIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR color ILIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    if let Some(brand) = &query.brand {
        qb.push(" AND lower(brand) = lower(").push_bind(brand.clone()).push(")");
    }
    if let Some(min) = query.price_min {
        qb.push(" AND price >= ").push_bind(min);
    }
    if let Some(max) = query.price_max {
        qb.push(" AND price <= ").push_bind(max);
    }
    if let Some(min) = query.year_min {
        qb.push(" AND year >= ").push_bind(min);
    }
    if let Some(max) = query.year_max {
        qb.push(" AND year <= ").push_bind(max);
    }
    if let Some(color) = &query.color {
        match query.color_match {
            ColorMatch::Equals => {
                qb.push(" AND lower(color) = lower(").push_bind(color.clone()).push(")");
            }
            ColorMatch::Contains => {
                qb.push(" AND color ILIKE ")
                    .push_bind(like_pattern(color))
                    .push(" ESCAPE '\\'");
            }
        }
    }
}

/// `%term%` with LIKE metacharacters escaped.
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn row_to_record(row: &PgRow) -> Result<ListingRecord, StoreError> {
    Ok(ListingRecord {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        source_key: row.try_get("source_key").map_err(map_sqlx_error)?,
        brand: row.try_get("brand").map_err(map_sqlx_error)?,
        model: row.try_get("model").map_err(map_sqlx_error)?,
        year: row.try_get("year").map_err(map_sqlx_error)?,
        price: row.try_get("price").map_err(map_sqlx_error)?,
        color: row.try_get("color").map_err(map_sqlx_error)?,
        link: row.try_get("link").map_err(map_sqlx_error)?,
        content_hash: row.try_get("content_hash").map_err(map_sqlx_error)?,
        first_seen_at: row.try_get("first_seen_at").map_err(map_sqlx_error)?,
        last_seen_at: row.try_get("last_seen_at").map_err(map_sqlx_error)?,
    })
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db_err) => {
            use sqlx::error::ErrorKind;
            match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::Constraint {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                    message: db_err.message().to_string(),
                },
                _ => StoreError::Backend(db_err.to_string()),
            }
        }
        other => StoreError::Backend(other.to_string()),
    }
}
