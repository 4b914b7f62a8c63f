use anyhow::{Context, Result};
use logpush_estimator::api::{start_api_server, AppState};
use logpush_estimator::config::Config;
use logpush_estimator::ingest::{start_ingest_server, IngestState};
use logpush_estimator::TimeSeriesStore;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        ingest_port = config.ingest.port,
        api_port = config.api.port,
        "Starting Logpush Estimator"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        TimeSeriesStore::builder(&config.database)
            .span(info_span!("observation_store", path = %config.database.path))
            .open()
            .await
            .context("Failed to initialize observation store")?,
    );

    let shutdown = CancellationToken::new();

    // Spawn ingestion server task
    let ingest_state = IngestState {
        store: store.clone(),
        service_name: config.service.name.clone(),
    };
    let ingest_config = config.ingest.clone();
    let ingest_shutdown = shutdown.clone();
    let ingest_handle = tokio::spawn(async move {
        if let Err(e) =
            start_ingest_server(ingest_state, &ingest_config, ingest_shutdown.clone()).await
        {
            error!(error = %e, "Ingestion server error");
            ingest_shutdown.cancel();
        }
    });

    // Spawn API server task
    let api_state = AppState::new(store.clone(), &config.api);
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown.clone()).await {
            error!(error = %e, "API server error");
            api_shutdown.cancel();
        }
    });

    info!("Logpush Estimator started successfully");

    // Wait for shutdown signal or a server failure
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {}
    }

    info!("Shutting down Logpush Estimator");
    shutdown.cancel();

    for (name, handle) in [("ingest", ingest_handle), ("api", api_handle)] {
        if let Err(e) = handle.await {
            error!(server = name, error = %e, "Server task panicked");
        }
    }

    store.close().await.context("Failed to close observation store")?;

    info!("Logpush Estimator stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
