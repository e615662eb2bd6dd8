//! Prometheus sink server
//!
//! Reads metric operations from the configured source, applies them to the
//! registry and serves the result for scraping.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics
//! - `GET /health` - Health check
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `PROM_SINK_CONFIG` environment variable (path to TOML file)
//! 2. `./prometheus-sink.toml` in current directory
//! 3. Default configuration
//!
//! # Example
//!
//! ```bash
//! # Pipe operations from stdin
//! producer | ./prometheus-sink
//!
//! # Read from a file and listen on another port
//! PROM_SINK_SOURCE=/var/run/ops.jsonl PROM_SINK_PORT=9200 ./prometheus-sink
//!
//! # Scrape
//! curl http://localhost:9102/metrics
//! ```

use std::sync::Arc;

use prometheus_sink::{
    config::load_config,
    exporter::{ExporterConfig, PrometheusExporter},
    ingestion::{open_source, IngestionDriver},
    ClockTelemetry, InstrumentOptions, InstrumentRegistry, MetricsServer, OperationDispatcher,
};
use tokio::signal;
use tracing::{error, info};

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("prometheus_sink=info".parse()?),
        )
        .init();

    info!("Prometheus sink starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;
    info!("Source: {}", config.source);
    info!("Listen address: {}:{}", config.listen_address, config.port);

    let delay = config.delay_before_start();
    if !delay.is_zero() {
        info!("Waiting {:?} before start", delay);
        tokio::time::sleep(delay).await;
    }

    // Build the pipeline
    let options = InstrumentOptions::from_config(&config.instruments);
    let registry = if config.collect_process_metrics {
        InstrumentRegistry::with_process_metrics(options)?
    } else {
        InstrumentRegistry::new(options)
    };
    let registry = Arc::new(registry);
    let dispatcher = Arc::new(OperationDispatcher::new(Arc::clone(&registry)));
    let telemetry = Arc::new(ClockTelemetry::new(Arc::clone(&registry)));
    let exporter = Arc::new(PrometheusExporter::new(
        ExporterConfig {
            metric_prefix: config.metric_prefix.clone(),
            ..Default::default()
        },
        Arc::clone(&dispatcher),
    )?);

    // Start the endpoint before touching the source
    let server = MetricsServer::new(exporter);
    let addr = server.start(config.socket_addr()?).await?;
    info!("Serving metrics on http://{}/metrics", addr);

    let driver = IngestionDriver::new(dispatcher, telemetry);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut source = open_source(&config.source).await?;
    let finished = tokio::select! {
        result = driver.run(source.as_mut()) => Some(result),
        _ = &mut shutdown => None,
    };

    if let Some(result) = finished {
        match result {
            Ok(summary) => info!(
                blocks = summary.blocks,
                operations = summary.operations,
                skipped = summary.skipped,
                undecodable = summary.undecodable,
                "Ingestion finished, still serving metrics"
            ),
            Err(e) => error!(error = %e, "Ingestion stopped, still serving metrics"),
        }
        shutdown.await;
    }

    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
