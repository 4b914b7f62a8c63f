use crate::analytics::{
    bucket_by_hour, size_distribution, sort_hour_buckets, summarize, HourBucket, SizeRangeBucket,
    SummaryStats,
};
use crate::config::ApiConfig;
use crate::observation_store::{Observation, TimeSeriesStore};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across query handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TimeSeriesStore>,
    pub recent_window: chrono::Duration,
    pub default_timeseries_hours: u32,
}

impl AppState {
    /// Build state from the API configuration
    pub fn new(store: Arc<TimeSeriesStore>, config: &ApiConfig) -> Self {
        Self {
            store,
            recent_window: config.recent_window(),
            default_timeseries_hours: config.default_timeseries_hours,
        }
    }
}

/// Envelope around every API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the request succeeded
    pub success: bool,
    /// Payload (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

fn success<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Start of a window of length `window` ending at `end`
///
/// Windows reaching past the earliest representable instant start there.
fn window_start(
    end: DateTime<FixedOffset>,
    window: chrono::Duration,
) -> DateTime<FixedOffset> {
    end.checked_sub_signed(window)
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC.fixed_offset())
}

fn failure(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }),
    )
}

/// Query parameters for the range endpoint
#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    /// Start time (RFC3339, inclusive)
    pub start: Option<String>,
    /// End time (RFC3339, exclusive)
    pub end: Option<String>,
}

/// Query parameters for the time series chart
#[derive(Debug, Default, Deserialize)]
pub struct TimeSeriesParams {
    /// Window length in hours
    pub hours: Option<String>,
}

/// Create the query API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/ready", get(readiness_check))
        .route("/api/stats/summary", get(summary))
        .route("/api/logs/recent", get(recent_observations))
        .route("/api/logs/range", get(range_observations))
        .route("/api/charts/timeseries", get(time_series))
        .route("/api/charts/breakdown", get(size_breakdown))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Summary statistics over every observation
#[instrument(skip(state))]
async fn summary(State(state): State<AppState>) -> ApiResult<SummaryStats> {
    let observations = state.store.all().await.map_err(|e| {
        error!(error = %e, "Failed to get all observations for stats");
        failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch statistics")
    })?;

    Ok(success(summarize(&observations)))
}

/// Observations inside the configured recent window
#[instrument(skip(state))]
async fn recent_observations(State(state): State<AppState>) -> ApiResult<Vec<Observation>> {
    let end = state.store.now();
    let start = window_start(end, state.recent_window);

    let observations = state.store.range_query(start, end).await.map_err(|e| {
        error!(error = %e, "Failed to query recent observations");
        failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch recent logs")
    })?;

    Ok(success(observations))
}

/// Observations in a caller-supplied `[start, end)` window
#[instrument(skip(state))]
async fn range_observations(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<Observation>> {
    let (Some(start), Some(end)) = (params.start.as_deref(), params.end.as_deref()) else {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "start and end parameters required",
        ));
    };

    let start = DateTime::parse_from_rfc3339(start).map_err(|_| {
        failure(
            StatusCode::BAD_REQUEST,
            "Invalid start time format (use RFC3339)",
        )
    })?;
    let end = DateTime::parse_from_rfc3339(end).map_err(|_| {
        failure(
            StatusCode::BAD_REQUEST,
            "Invalid end time format (use RFC3339)",
        )
    })?;

    let observations = state.store.range_query(start, end).await.map_err(|e| {
        error!(error = %e, start = %start, end = %end, "Failed to query observations by range");
        failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch logs")
    })?;

    Ok(success(observations))
}

/// Hourly totals over the last `hours` hours, oldest first
#[instrument(skip(state))]
async fn time_series(
    State(state): State<AppState>,
    Query(params): Query<TimeSeriesParams>,
) -> ApiResult<Vec<HourBucket>> {
    let hours = params
        .hours
        .as_deref()
        .and_then(|h| h.parse::<u32>().ok())
        .filter(|&h| h > 0)
        .unwrap_or(state.default_timeseries_hours);

    let end = state.store.now();
    let start = window_start(end, chrono::Duration::hours(i64::from(hours)));

    let observations = state.store.range_query(start, end).await.map_err(|e| {
        error!(error = %e, hours, "Failed to query observations for time series");
        failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch time series data",
        )
    })?;

    let mut buckets = bucket_by_hour(&observations);
    sort_hour_buckets(&mut buckets);

    Ok(success(buckets))
}

/// Size distribution over every observation
#[instrument(skip(state))]
async fn size_breakdown(State(state): State<AppState>) -> ApiResult<Vec<SizeRangeBucket>> {
    let observations = state.store.all().await.map_err(|e| {
        error!(error = %e, "Failed to get observations for breakdown");
        failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch breakdown data",
        )
    })?;

    Ok(success(size_distribution(&observations)))
}

/// Serve the query API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting query API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
