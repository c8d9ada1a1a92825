//! Axum JSON API over the cursor query engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use carlot_core::{parse_cursor, parse_limit, ColorMatch, ListingFilter, Page, ValidationError};
use carlot_storage::{CursorQueryEngine, QueryError, StoreError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "carlot-web";
pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub engine: CursorQueryEngine,
}

impl AppState {
    pub fn new(engine: CursorQueryEngine) -> Self {
        Self { engine }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/listings", get(listings_handler))
        .route(
            "/api/listings/filter",
            get(filter_query_handler).post(filter_json_handler),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("CARLOT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Unavailable(message) => {
                warn!(%message, "listing store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, message)
            }
            Self::Internal(message) => {
                error!(%message, "listing query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Validation(err) => err.into(),
            QueryError::Store(err @ StoreError::Unavailable(_)) => Self::Unavailable(err.to_string()),
            QueryError::Store(err) => Self::Internal(err.to_string()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListingsParams {
    cursor: Option<String>,
    limit: Option<String>,
    search: Option<String>,
}

/// Cursor and limit arrive as strings in a query string but may be numbers in a JSON body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Int(i64),
    Text(String),
}

impl WireNumber {
    fn into_text(self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FilterRequest {
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    price_min: Option<i64>,
    #[serde(default)]
    price_max: Option<i64>,
    #[serde(default)]
    year_min: Option<i32>,
    #[serde(default)]
    year_max: Option<i32>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    color_match: Option<ColorMatch>,
    #[serde(default)]
    cursor: Option<WireNumber>,
    #[serde(default)]
    limit: Option<WireNumber>,
}

impl FilterRequest {
    fn into_parts(self) -> Result<(ListingFilter, Option<i64>, Option<usize>), ValidationError> {
        let cursor = self
            .cursor
            .map(|c| parse_cursor(&c.into_text()))
            .transpose()?;
        let limit = self.limit.map(|l| parse_limit(&l.into_text())).transpose()?;
        let filter = ListingFilter {
            brand: self.brand,
            price_min: self.price_min,
            price_max: self.price_max,
            year_min: self.year_min,
            year_max: self.year_max,
            color: self.color,
            color_match: self.color_match,
        };
        Ok((filter, cursor, limit))
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ListingsParams>, QueryRejection>,
) -> Result<Json<Page>, ApiError> {
    let Query(params) = params?;
    let cursor = params.cursor.as_deref().map(parse_cursor).transpose()?;
    let limit = params.limit.as_deref().map(parse_limit).transpose()?;
    let page = state
        .engine
        .search(params.search.as_deref(), cursor, limit)
        .await?;
    Ok(Json(page))
}

async fn filter_query_handler(
    State(state): State<Arc<AppState>>,
    request: Result<Query<FilterRequest>, QueryRejection>,
) -> Result<Json<Page>, ApiError> {
    let Query(request) = request?;
    run_filter(&state, request).await
}

async fn filter_json_handler(
    State(state): State<Arc<AppState>>,
    request: Result<Json<FilterRequest>, JsonRejection>,
) -> Result<Json<Page>, ApiError> {
    let Json(request) = request?;
    run_filter(&state, request).await
}

async fn run_filter(state: &AppState, request: FilterRequest) -> Result<Json<Page>, ApiError> {
    let (filter, cursor, limit) = request.into_parts()?;
    let page = state.engine.filter(filter, cursor, limit).await?;
    Ok(Json(page))
}
