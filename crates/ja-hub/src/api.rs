//! # API Handlers
//!
//! Axum handlers for the analytics, cache and ingestion endpoints. Query
//! strings are turned into a typed [`AggregationRequest`] here; nothing
//! past this module sees raw parameters.
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/api/analytics/:dimension`, `/api/v1/analytics/:dimension` | GET | aggregate one dimension |
//! | `/api/records/count` | GET | record coverage for a window |
//! | `/api/ingest` | POST | append a batch, invalidate the cache |
//! | `/api/cache/info` | GET | cache statistics |
//! | `/api/cache/clear` | POST | drop all cached results |
//! | `/health` | GET | liveness |

use crate::planner::{CacheStats, IngestOutcome};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use ja_core::{
    AggregationRequest, AnalyticsError, Bucket, Dimension, FilterSet, Granularity, SalarySummary,
    Seniority, TimeWindow,
};
use ja_store::adapter::RecordCount;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const API_VERSION: &str = "v1";

const WINDOW_PARAMS: [&str; 2] = ["from", "to"];
const FILTER_PARAMS: [&str; 6] = ["company", "location", "seniority", "source", "title", "skills"];

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/analytics/:dimension", get(analytics))
        .route("/api/v1/analytics/:dimension", get(analytics))
        .route("/api/records/count", get(records_count))
        .route("/api/ingest", post(ingest))
        .route("/api/cache/info", get(cache_info))
        .route("/api/cache/clear", post(cache_clear))
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(err: AnalyticsError) -> Self {
        let status = match &err {
            AnalyticsError::InvalidWindow { .. }
            | AnalyticsError::UnsupportedDimension(_)
            | AnalyticsError::WindowTooLarge { .. } => StatusCode::BAD_REQUEST,
            AnalyticsError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AnalyticsError::SchemaMismatch { .. } | AnalyticsError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!("{} ({}): {}", self.status, self.kind, self.message);
        }
        let body = Json(ErrorBody {
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
            },
        });
        (self.status, body).into_response()
    }
}

// =============================================================================
// Parameter parsing
// =============================================================================

fn reject_unknown(params: &HashMap<String, String>, allowed: &[&[&str]]) -> Result<(), ApiError> {
    let mut unknown: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.iter().any(|group| group.contains(k)))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort_unstable();
    Err(ApiError::bad_request(format!(
        "unknown query parameter(s): {}",
        unknown.join(", ")
    )))
}

/// `YYYY-MM-DD`, or an RFC 3339 timestamp (its UTC date is used).
fn parse_date(name: &str, value: &str) -> Result<NaiveDate, ApiError> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).date_naive())
        })
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "'{}' must be a YYYY-MM-DD date or RFC 3339 timestamp, got '{}'",
                name, value
            ))
        })
}

fn parse_window(params: &HashMap<String, String>) -> Result<TimeWindow, ApiError> {
    let required = |name: &str| {
        params
            .get(name)
            .ok_or_else(|| ApiError::bad_request(format!("missing required parameter '{}'", name)))
            .and_then(|v| parse_date(name, v))
    };
    let window = TimeWindow::new(required("from")?, required("to")?);
    window.validate()?;
    Ok(window)
}

fn parse_filters(params: &HashMap<String, String>) -> Result<FilterSet, ApiError> {
    let text = |name: &str| params.get(name).cloned();
    let seniority = match params.get("seniority") {
        Some(raw) => Some(raw.parse::<Seniority>().map_err(ApiError::bad_request)?),
        None => None,
    };
    let skills = params
        .get("skills")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(FilterSet {
        company: text("company"),
        location: text("location"),
        seniority,
        source: text("source"),
        title: text("title"),
        skills,
    })
}

/// Build the typed request. Checks run in a fixed order: parameter names,
/// dates, window, dimension, granularity.
pub fn parse_analytics_request(
    dimension: &str,
    params: &HashMap<String, String>,
) -> Result<AggregationRequest, ApiError> {
    reject_unknown(params, &[&WINDOW_PARAMS, &FILTER_PARAMS, &["granularity"]])?;
    let window = parse_window(params)?;
    let dimension: Dimension = dimension.parse()?;
    let filters = parse_filters(params)?;

    let mut request = AggregationRequest::new(dimension, window).with_filters(filters);
    if let Some(raw) = params.get("granularity") {
        request = request.with_granularity(raw.parse::<Granularity>()?);
    }
    Ok(request.normalized()?)
}

// =============================================================================
// Analytics
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse {
    pub api_version: &'static str,
    pub dimension: Dimension,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub granularity: Option<Granularity>,
    pub total_count: u64,
    pub skipped_count: u64,
    pub buckets: Vec<Bucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_summary: Option<SalarySummary>,
    pub computed_at: DateTime<Utc>,
    pub cached: bool,
    pub request: AggregationRequest,
}

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Path(dimension): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let request = parse_analytics_request(&dimension, &params)?;
    let resolved = state.planner.resolve(&request).await?;
    let result = resolved.result;

    Ok(Json(AnalyticsResponse {
        api_version: API_VERSION,
        dimension: result.dimension,
        from: result.window.start,
        to: result.window.end,
        granularity: result.granularity,
        total_count: result.total_count,
        skipped_count: result.skipped_count,
        buckets: result.buckets.clone(),
        salary_summary: result.salary_summary.clone(),
        computed_at: resolved.computed_at,
        cached: resolved.cache_hit,
        request,
    }))
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(flatten)]
    pub counts: RecordCount,
}

pub async fn records_count(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CountResponse>, ApiError> {
    reject_unknown(&params, &[&WINDOW_PARAMS, &FILTER_PARAMS])?;
    let window = parse_window(&params)?;
    let filters = parse_filters(&params)?;
    let counts = state.planner.count(&filters, &window).await?;
    Ok(Json(CountResponse {
        from: window.start,
        to: window.end,
        counts,
    }))
}

/// Body is a JSON array of raw records, or `{"items": [...]}`.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("body is not valid JSON: {}", e)))?;
    let batch = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => match obj.remove("items") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(ApiError::bad_request("object body must carry an 'items' array")),
        },
        _ => return Err(ApiError::bad_request("body must be an array of records")),
    };
    if batch.is_empty() {
        return Err(ApiError::bad_request("batch is empty"));
    }
    if let Some(pos) = batch.iter().position(|r| !r.is_object()) {
        return Err(ApiError::bad_request(format!(
            "record {} is not a JSON object",
            pos
        )));
    }

    let outcome = state.planner.ingest(batch).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

// =============================================================================
// Cache / health
// =============================================================================

pub async fn cache_info(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.planner.stats().await)
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

pub async fn cache_clear(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let cleared = state.planner.clear().await;
    Json(ClearResponse { cleared })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub store: String,
    pub generation: u64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store: state.planner.store_name().to_string(),
        generation: state.planner.generation(),
    })
}
