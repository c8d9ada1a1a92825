//! Listing source contract + the carsensor.net adapter.
//!
//! Upstream markup is unversioned, so parsing is a pure function that yields one
//! `Result<CandidateRecord, ParseError>` per listing block. A broken block never takes
//! the rest of the page (or the run) down with it.

use std::sync::Arc;

use async_trait::async_trait;
use carlot_core::CandidateRecord;
use carlot_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "carlot-adapters";

pub const CARSENSOR_BASE_URL: &str = "https://www.carsensor.net";
pub const CARSENSOR_SEARCH_URL: &str = "https://www.carsensor.net/usedcar/search.php";

const BRAND_MAP: &[(&str, &str)] = &[
    ("トヨタ", "Toyota"),
    ("ホンダ", "Honda"),
    ("日産", "Nissan"),
    ("マツダ", "Mazda"),
    ("スバル", "Subaru"),
    ("スズキ", "Suzuki"),
    ("三菱", "Mitsubishi"),
    ("ダイハツ", "Daihatsu"),
    ("レクサス", "Lexus"),
];

// Checked in order; the first word contained in a body-info item wins.
const COLOR_MAP: &[(&str, &str)] = &[
    ("白", "White"),
    ("ホワイト", "White"),
    ("黒", "Black"),
    ("ブラック", "Black"),
    ("銀", "Silver"),
    ("シルバー", "Silver"),
    ("赤", "Red"),
    ("レッド", "Red"),
    ("青", "Blue"),
    ("ブルー", "Blue"),
    ("緑", "Green"),
    ("グリーン", "Green"),
    ("黄", "Yellow"),
    ("イエロー", "Yellow"),
    ("灰", "Gray"),
    ("グレー", "Gray"),
    ("茶", "Brown"),
    ("ブラウン", "Brown"),
    ("パール", "Pearl"),
    ("ゴールド", "Gold"),
];

pub const UNKNOWN_COLOR: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("listing #{index}: missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("listing #{index}: invalid {field} {value:?}")]
    InvalidValue {
        index: usize,
        field: &'static str,
        value: String,
    },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid url {0:?}")]
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub page_no: u32,
    pub url: String,
    pub body: String,
}

/// Outcome of parsing one listing page: one entry per listing block, in page order.
pub type ParsedPage = Vec<Result<CandidateRecord, ParseError>>;

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, run_id: Uuid, page_no: u32) -> Result<FetchedPage, FetchError>;

    /// Outer error: the page as a whole is unusable. Inner errors: single listings.
    fn parse_page(&self, page: &FetchedPage) -> Result<ParsedPage, ParseError>;
}

#[derive(Debug, Clone)]
pub struct CarSensorSource {
    http: Arc<HttpFetcher>,
    search_url: Url,
    base_url: Url,
}

impl CarSensorSource {
    pub fn new(http: Arc<HttpFetcher>, search_url: &str) -> Result<Self, ParseError> {
        let search_url = Url::parse(search_url).map_err(|_| ParseError::Url(search_url.to_string()))?;
        let base_url = Url::parse(CARSENSOR_BASE_URL)
            .map_err(|_| ParseError::Url(CARSENSOR_BASE_URL.to_string()))?;
        Ok(Self {
            http,
            search_url,
            base_url,
        })
    }
}

#[async_trait]
impl ListingSource for CarSensorSource {
    fn source_id(&self) -> &'static str {
        "carsensor"
    }

    async fn fetch_page(&self, run_id: Uuid, page_no: u32) -> Result<FetchedPage, FetchError> {
        let url = listing_page_url(&self.search_url, page_no).to_string();
        let response = self.http.fetch_text(run_id, &url).await?;
        debug!(page_no, attempts = response.attempts, bytes = response.body.len(), "fetched listing page");
        Ok(FetchedPage {
            page_no,
            url: response.final_url,
            body: response.body,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<ParsedPage, ParseError> {
        parse_listing_page(&page.body, &self.base_url)
    }
}

pub fn listing_page_url(search_url: &Url, page_no: u32) -> Url {
    let mut url = search_url.clone();
    if page_no > 1 {
        url.query_pairs_mut().append_pair("page", &page_no.to_string());
    }
    url
}

/// Stable listing identity: scheme and host lowercased, query and fragment dropped,
/// trailing slash trimmed. Inputs that are not absolute URLs are only trimmed.
/// Returns `None` for blank input. Idempotent.
pub fn canonical_source_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(mut url) = Url::parse(trimmed) else {
        return Some(trimmed.to_string());
    };
    url.set_query(None);
    url.set_fragment(None);
    let key = url.as_str().trim_end_matches('/').to_string();
    Some(key)
}

struct Selectors {
    cassette: Selector,
    title_link: Selector,
    title: Selector,
    any_p: Selector,
    info_p: Selector,
    spec_box: Selector,
    spec_title: Selector,
    spec_year: Selector,
    main_price: Selector,
    sub_price: Selector,
    body_info: Selector,
}

impl Selectors {
    fn new() -> Result<Self, ParseError> {
        Ok(Self {
            cassette: sel("div.cassette")?,
            title_link: sel("h3.cassetteMain__title a")?,
            title: sel("h3.cassetteMain__title")?,
            any_p: sel("p")?,
            info_p: sel("div.cassetteMain__carInfoContainer p")?,
            spec_box: sel("div.specList__detailBox")?,
            spec_title: sel("dt.specList__title")?,
            spec_year: sel("dd.specList__data span.specList__emphasisData")?,
            main_price: sel("div.totalPrice span.totalPrice__mainPriceNum")?,
            sub_price: sel("div.totalPrice span.totalPrice__subPriceNum")?,
            body_info: sel("li.carBodyInfoList__item")?,
        })
    }
}

fn sel(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Parse a carsensor.net search results page. An empty vector means the page had no
/// listing blocks, which the worker treats as the end of the result set.
pub fn parse_listing_page(html: &str, base_url: &Url) -> Result<ParsedPage, ParseError> {
    let selectors = Selectors::new()?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selectors.cassette)
        .enumerate()
        .map(|(index, cassette)| parse_cassette(&selectors, index, cassette, base_url))
        .collect())
}

fn parse_cassette(
    s: &Selectors,
    index: usize,
    cassette: ElementRef<'_>,
    base_url: &Url,
) -> Result<CandidateRecord, ParseError> {
    let missing = |field| ParseError::MissingField { index, field };
    let invalid = |field, value: &str| ParseError::InvalidValue {
        index,
        field,
        value: value.to_string(),
    };

    let title_el = cassette.select(&s.title).next().ok_or_else(|| missing("title"))?;
    let link_el = title_el.select(&s.title_link).next();
    let title_text = element_text(link_el.unwrap_or(title_el));
    let model = title_text
        .split_whitespace()
        .next()
        .ok_or_else(|| missing("model"))?
        .to_string();

    let href = link_el
        .and_then(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| missing("link"))?;
    let mut link = base_url.join(href).map_err(|_| invalid("link", href))?;
    link.set_fragment(None);
    let source_key = canonical_source_key(link.as_str()).ok_or_else(|| invalid("link", href))?;

    let brand = extract_brand(s, cassette).ok_or_else(|| missing("brand"))?;
    let year = extract_year(s, cassette, index)?;
    let price = extract_price(s, cassette, index)?;
    let color = extract_color(s, cassette);

    Ok(CandidateRecord {
        source_key,
        brand,
        model,
        year,
        price,
        color,
        link: link.to_string(),
    })
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

pub fn normalize_brand(raw: &str) -> String {
    let raw = raw.trim();
    BRAND_MAP
        .iter()
        .find(|(jp, _)| *jp == raw)
        .map(|(_, en)| (*en).to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn is_known_maker(text: &str) -> bool {
    BRAND_MAP.iter().any(|(jp, en)| *jp == text || *en == text)
}

fn extract_brand(s: &Selectors, cassette: ElementRef<'_>) -> Option<String> {
    let known = cassette
        .select(&s.any_p)
        .map(element_text)
        .find(|t| is_known_maker(t));
    let raw = known.or_else(|| {
        cassette
            .select(&s.info_p)
            .map(element_text)
            .find(|t| !t.is_empty())
    })?;
    Some(normalize_brand(&raw))
}

fn extract_year(s: &Selectors, cassette: ElementRef<'_>, index: usize) -> Result<i32, ParseError> {
    let year_box = cassette.select(&s.spec_box).find(|b| {
        b.select(&s.spec_title)
            .next()
            .is_some_and(|dt| element_text(dt).contains("年式"))
    });
    let text = year_box
        .and_then(|b| b.select(&s.spec_year).next())
        .map(element_text)
        .ok_or(ParseError::MissingField { index, field: "year" })?;
    first_four_digits(&text)
        .and_then(|y| y.parse().ok())
        .ok_or(ParseError::InvalidValue {
            index,
            field: "year",
            value: text,
        })
}

fn first_four_digits(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    (0..bytes.len().saturating_sub(3))
        .find(|&i| bytes[i..i + 4].iter().all(u8::is_ascii_digit))
        .map(|i| &text[i..i + 4])
}

/// Total price in JPY from man-yen parts (`148` + `.2` = 1,482,000).
fn extract_price(s: &Selectors, cassette: ElementRef<'_>, index: usize) -> Result<i64, ParseError> {
    let main = cassette
        .select(&s.main_price)
        .next()
        .map(element_text)
        .ok_or(ParseError::MissingField { index, field: "price" })?;
    let digits: String = main.chars().filter(|c| *c != ',').collect();
    let man: i64 = digits.parse().map_err(|_| ParseError::InvalidValue {
        index,
        field: "price",
        value: main.clone(),
    })?;
    let tenth = cassette
        .select(&s.sub_price)
        .next()
        .map(element_text)
        .and_then(|sub| sub.chars().find(char::is_ascii_digit))
        .and_then(|d| d.to_digit(10))
        .unwrap_or(0);
    man.checked_mul(10_000)
        .and_then(|yen| yen.checked_add(i64::from(tenth) * 1_000))
        .ok_or(ParseError::InvalidValue {
            index,
            field: "price",
            value: main,
        })
}

pub fn normalize_color(text: &str) -> Option<&'static str> {
    COLOR_MAP
        .iter()
        .find(|(jp, _)| text.contains(jp))
        .map(|(_, en)| *en)
}

fn extract_color(s: &Selectors, cassette: ElementRef<'_>) -> String {
    cassette
        .select(&s.body_info)
        .find_map(|li| normalize_color(&element_text(li)))
        .unwrap_or(UNKNOWN_COLOR)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse(CARSENSOR_BASE_URL).unwrap()
    }

    fn cassette(inner: &str) -> String {
        format!(r#"<html><body><div class="cassette">{inner}</div></body></html>"#)
    }

    const TITLE: &str = r#"<div class="cassetteMain__carInfoContainer"><p>スズキ</p>
        <h3 class="cassetteMain__title"><a href="/usedcar/detail/X1/index.html">ジムニー XC</a></h3></div>"#;
    const YEAR: &str = r#"<div class="specList__detailBox"><dt class="specList__title">年式</dt>
        <dd class="specList__data"><span class="specList__emphasisData">2022(R04)</span></dd></div>"#;
    const PRICE: &str = r#"<div class="totalPrice"><span class="totalPrice__mainPriceNum">230</span>
        <span class="totalPrice__subPriceNum">.5</span></div>"#;

    #[test]
    fn parses_a_complete_cassette() {
        let html = cassette(&format!("{TITLE}{YEAR}{PRICE}<li class=\"carBodyInfoList__item\">ブラック</li>"));
        let parsed = parse_listing_page(&html, &base()).unwrap();
        let record = parsed[0].clone().unwrap();
        assert_eq!(record.brand, "Suzuki");
        assert_eq!(record.model, "ジムニー");
        assert_eq!(record.year, 2022);
        assert_eq!(record.price, 2_305_000);
        assert_eq!(record.color, "Black");
        assert_eq!(record.link, "https://www.carsensor.net/usedcar/detail/X1/index.html");
        assert_eq!(record.source_key, record.link);
    }

    #[test]
    fn missing_year_and_price_are_parse_errors() {
        let html = cassette(&format!("{TITLE}{PRICE}"));
        let parsed = parse_listing_page(&html, &base()).unwrap();
        assert_eq!(
            parsed[0],
            Err(ParseError::MissingField { index: 0, field: "year" })
        );

        let html = cassette(&format!("{TITLE}{YEAR}"));
        let parsed = parse_listing_page(&html, &base()).unwrap();
        assert_eq!(
            parsed[0],
            Err(ParseError::MissingField { index: 0, field: "price" })
        );
    }

    #[test]
    fn unknown_color_falls_back() {
        let html = cassette(&format!("{TITLE}{YEAR}{PRICE}<li class=\"carBodyInfoList__item\">4WD</li>"));
        let record = parse_listing_page(&html, &base()).unwrap()[0].clone().unwrap();
        assert_eq!(record.color, UNKNOWN_COLOR);
    }

    #[test]
    fn page_without_cassettes_is_empty() {
        let parsed = parse_listing_page("<html><body><p>0件</p></body></html>", &base()).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn canonical_source_key_is_stable() {
        let a = canonical_source_key("HTTPS://WWW.CarSensor.net/usedcar/detail/AU1/index.html?TRCD=1#top").unwrap();
        assert_eq!(a, "https://www.carsensor.net/usedcar/detail/AU1/index.html");
        assert_eq!(canonical_source_key(&a).unwrap(), a);
        assert_eq!(
            canonical_source_key("https://www.carsensor.net/usedcar/detail/AU1/").unwrap(),
            "https://www.carsensor.net/usedcar/detail/AU1"
        );
        assert_eq!(canonical_source_key("  listing-42 ").unwrap(), "listing-42");
        assert_eq!(canonical_source_key("   "), None);
    }

    #[test]
    fn page_urls_carry_page_number_after_first() {
        let search = Url::parse(CARSENSOR_SEARCH_URL).unwrap();
        assert_eq!(listing_page_url(&search, 1).as_str(), CARSENSOR_SEARCH_URL);
        assert_eq!(
            listing_page_url(&search, 3).as_str(),
            "https://www.carsensor.net/usedcar/search.php?page=3"
        );
    }

    #[test]
    fn first_four_digits_handles_era_suffix() {
        assert_eq!(first_four_digits("2019(R01)"), Some("2019"));
        assert_eq!(first_four_digits("H28"), None);
    }
}
