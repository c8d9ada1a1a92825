//! Structured filter contract for callers that build predicates (e.g. a conversational
//! front-end) instead of free-text search.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ListingQuery;

const MAX_TEXT_LEN: usize = 100;
const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMatch {
    #[default]
    Equals,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be blank")]
    Blank { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("{field} {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{min_field} is greater than {max_field}")]
    InvertedRange {
        min_field: &'static str,
        max_field: &'static str,
    },
    #[error("invalid cursor {0:?}")]
    InvalidCursor(String),
    #[error("invalid limit {0:?}")]
    InvalidLimit(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListingFilter {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub price_min: Option<i64>,
    #[serde(default)]
    pub price_max: Option<i64>,
    #[serde(default)]
    pub year_min: Option<i32>,
    #[serde(default)]
    pub year_max: Option<i32>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub color_match: Option<ColorMatch>,
}

impl ListingFilter {
    /// Validate and lower into the predicate the cursor query engine executes.
    pub fn into_query(self) -> Result<ListingQuery, ValidationError> {
        let brand = clean_text("brand", self.brand)?;
        let color = clean_text("color", self.color)?;

        check_non_negative("priceMin", self.price_min)?;
        check_non_negative("priceMax", self.price_max)?;
        check_year("yearMin", self.year_min)?;
        check_year("yearMax", self.year_max)?;

        if let (Some(min), Some(max)) = (self.price_min, self.price_max) {
            if min > max {
                return Err(ValidationError::InvertedRange {
                    min_field: "priceMin",
                    max_field: "priceMax",
                });
            }
        }
        if let (Some(min), Some(max)) = (self.year_min, self.year_max) {
            if min > max {
                return Err(ValidationError::InvertedRange {
                    min_field: "yearMin",
                    max_field: "yearMax",
                });
            }
        }

        Ok(ListingQuery {
            search: None,
            brand,
            price_min: self.price_min,
            price_max: self.price_max,
            year_min: self.year_min,
            year_max: self.year_max,
            color,
            color_match: self.color_match.unwrap_or_default(),
        })
    }
}

fn clean_text(field: &'static str, value: Option<String>) -> Result<Option<String>, ValidationError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Blank { field });
    }
    if trimmed.chars().count() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_TEXT_LEN,
        });
    }
    Ok(Some(trimmed.to_string()))
}

fn check_non_negative(field: &'static str, value: Option<i64>) -> Result<(), ValidationError> {
    match value {
        Some(v) if v < 0 => Err(ValidationError::Negative { field }),
        _ => Ok(()),
    }
}

fn check_year(field: &'static str, value: Option<i32>) -> Result<(), ValidationError> {
    match value {
        Some(y) if !(MIN_YEAR..=MAX_YEAR).contains(&y) => Err(ValidationError::OutOfRange {
            field,
            value: y.into(),
            min: MIN_YEAR.into(),
            max: MAX_YEAR.into(),
        }),
        _ => Ok(()),
    }
}
