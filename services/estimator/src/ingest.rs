//! Ingestion endpoint: measures each accepted payload and records its size.

use crate::config::IngestConfig;
use crate::observation_store::TimeSeriesStore;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// State shared by the ingestion handlers
#[derive(Clone)]
pub struct IngestState {
    pub store: Arc<TimeSeriesStore>,
    pub service_name: String,
}

/// Create the ingestion router
pub fn create_router(state: IngestState, config: &IngestConfig) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<IngestState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.service_name
    }))
}

/// Record the size of the request body
///
/// Empty bodies are rejected here; the store itself accepts zero.
#[instrument(skip(state, body), fields(body_size = body.len()))]
async fn ingest(State(state): State<IngestState>, body: Bytes) -> (StatusCode, &'static str) {
    if body.is_empty() {
        warn!("Empty request body received");
        return (StatusCode::BAD_REQUEST, "Request body cannot be empty");
    }

    match state.store.insert(body.len() as u64).await {
        Ok(observation) => {
            info!(id = observation.id, "Payload size recorded");
            (StatusCode::OK, "OK")
        }
        Err(e) => {
            error!(error = %e, "Failed to record payload size");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to write log size")
        }
    }
}

/// Serve the ingestion endpoint until `shutdown` is cancelled
pub async fn start_ingest_server(
    state: IngestState,
    config: &IngestConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingestion server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Ingestion server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::DatabaseConfig;
    use tempfile::TempDir;

    async fn test_state(dir: &TempDir) -> IngestState {
        let config = DatabaseConfig::with_path(dir.path().join("ingest.db").to_string_lossy());
        let store = TimeSeriesStore::builder(&config)
            .clock(Arc::new(SystemClock))
            .open()
            .await
            .unwrap();
        IngestState {
            store: Arc::new(store),
            service_name: "logpush-estimator".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ingest_records_body_size() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        let (status, body) = ingest(State(state.clone()), Bytes::from(vec![b'x'; 2048])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");

        let stored = state.store.all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].size_bytes, 2048);
    }

    #[tokio::test]
    async fn test_ingest_rejects_empty_body() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        let (status, body) = ingest(State(state.clone()), Bytes::new()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Request body cannot be empty");
        assert!(state.store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_reports_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        state.store.close().await.unwrap();

        let (status, body) = ingest(State(state), Bytes::from_static(b"payload")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Failed to write log size");
    }
}
