//! Core domain model for carlot: listings, candidates, pages and the shared query predicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod filter;

pub use filter::{ColorMatch, ListingFilter, ValidationError};

pub const CRATE_NAME: &str = "carlot-core";

/// Extracted-but-not-yet-persisted listing handed from the extraction worker to the dedup engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_key: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price: i64,
    pub color: String,
    pub link: String,
}

/// Canonical persisted listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRecord {
    pub id: i64,
    pub source_key: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price: i64,
    pub color: String,
    pub link: String,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One page of a newest-first traversal. `next_cursor` is the id of the last item,
/// absent once the traversal is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<ListingRecord>,
    pub next_cursor: Option<i64>,
    pub total: u64,
}

impl Page {
    pub fn empty(total: u64) -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            total,
        }
    }
}

/// Predicate shared by free-text search and structured filters. Every read path
/// lowers into this before touching a store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingQuery {
    pub search: Option<String>,
    pub brand: Option<String>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub color: Option<String>,
    pub color_match: ColorMatch,
}

impl ListingQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Free-text search; blank terms mean "no filter".
    pub fn search(term: Option<&str>) -> Self {
        Self {
            search: term
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string),
            ..Self::default()
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self == &Self::default()
    }

    /// In-process evaluation with the same semantics the SQL store applies.
    pub fn matches(&self, record: &ListingRecord) -> bool {
        if let Some(term) = &self.search {
            let any = contains_ci(&record.brand, term)
                || contains_ci(&record.model, term)
                || contains_ci(&record.color, term);
            if !any {
                return false;
            }
        }
        if let Some(brand) = &self.brand {
            if !eq_ci(&record.brand, brand) {
                return false;
            }
        }
        if self.price_min.is_some_and(|min| record.price < min) {
            return false;
        }
        if self.price_max.is_some_and(|max| record.price > max) {
            return false;
        }
        if self.year_min.is_some_and(|min| record.year < min) {
            return false;
        }
        if self.year_max.is_some_and(|max| record.year > max) {
            return false;
        }
        if let Some(color) = &self.color {
            let ok = match self.color_match {
                ColorMatch::Equals => eq_ci(&record.color, color),
                ColorMatch::Contains => contains_ci(&record.color, color),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

pub fn eq_ci(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Parse a wire cursor. Cursors are positive listing ids.
pub fn parse_cursor(raw: &str) -> Result<i64, ValidationError> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ValidationError::InvalidCursor(raw.to_string())),
    }
}

/// Parse a wire page size. Zero is accepted (the query engine clamps it to one);
/// negative or non-numeric values are not.
pub fn parse_limit(raw: &str) -> Result<usize, ValidationError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| ValidationError::InvalidLimit(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(brand: &str, model: &str, color: &str, year: i32, price: i64) -> ListingRecord {
        let ts = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap();
        ListingRecord {
            id: 1,
            source_key: "https://www.carsensor.net/usedcar/detail/au1/index.html".into(),
            brand: brand.into(),
            model: model.into(),
            year,
            price,
            color: color.into(),
            link: "https://www.carsensor.net/usedcar/detail/AU1/index.html".into(),
            content_hash: "h".into(),
            first_seen_at: ts,
            last_seen_at: ts,
        }
    }

    #[test]
    fn search_matches_brand_model_or_color_case_insensitively() {
        let q = ListingQuery::search(Some("toyota"));
        assert!(q.matches(&record("Toyota", "Prius", "White", 2019, 1_000_000)));
        assert!(q.matches(&record("Lexus", "ToyotaAce", "White", 2019, 1_000_000)));
        assert!(!q.matches(&record("Honda", "Fit", "Red", 2019, 1_000_000)));

        let q = ListingQuery::search(Some("PEARL"));
        assert!(q.matches(&record("Honda", "Fit", "Pearl", 2019, 1_000_000)));
    }

    #[test]
    fn blank_search_is_unfiltered() {
        assert!(ListingQuery::search(Some("   ")).is_unfiltered());
        assert!(ListingQuery::search(None).is_unfiltered());
        assert!(ListingQuery::all().matches(&record("Honda", "Fit", "Red", 2019, 1)));
    }

    #[test]
    fn cursor_parsing_rejects_garbage() {
        assert_eq!(parse_cursor("42").unwrap(), 42);
        assert!(parse_cursor("0").is_err());
        assert!(parse_cursor("-3").is_err());
        assert!(parse_cursor("abc").is_err());
    }

    #[test]
    fn limit_parsing_rejects_negative_and_garbage() {
        assert_eq!(parse_limit("0"), Ok(0));
        assert_eq!(parse_limit(" 25 "), Ok(25));
        assert_eq!(parse_limit("-1"), Err(ValidationError::InvalidLimit("-1".into())));
        assert!(parse_limit("ten").is_err());
    }

    #[test]
    fn listing_record_serializes_camel_case() {
        let json = serde_json::to_value(record("Honda", "Fit", "Red", 2019, 1)).unwrap();
        assert!(json.get("sourceKey").is_some());
        assert!(json.get("lastSeenAt").is_some());
        let page = serde_json::to_value(Page::empty(0)).unwrap();
        assert!(page.get("nextCursor").unwrap().is_null());
    }
}
