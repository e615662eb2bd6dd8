//! Metrics HTTP endpoint
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus exposition payload
//! - `GET /health` - Health check
//!
//! Any other path also serves the exposition payload, so scrapers
//! configured with a custom metrics path keep working.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::exporter::PrometheusExporter;

// =============================================================================
// Application State
// =============================================================================

/// Shared state of the HTTP handlers
pub struct AppState {
    pub exporter: Arc<PrometheusExporter>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.exporter.export_http() {
        Ok((body, content_type)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body)
        }
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("Failed to render metrics: {}", e),
            )
        }
    }
}

/// Build the router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(metrics)
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// Metrics endpoint that binds at most once per instance
pub struct MetricsServer {
    state: Arc<AppState>,
    bound: OnceCell<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsServer {
    /// Create a server for `exporter`; nothing is bound until [`start`](Self::start)
    pub fn new(exporter: Arc<PrometheusExporter>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(AppState { exporter }),
            bound: OnceCell::new(),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Bind `addr` and serve in the background.
    ///
    /// Only the first call binds. Later calls, concurrent ones included,
    /// return the address bound by the first successful call.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let bound = self
            .bound
            .get_or_try_init(|| async {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                info!("Starting metrics endpoint on {}", local);

                let app = build_router(Arc::clone(&self.state));
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                let handle = tokio::spawn(async move {
                    let shutdown = async move {
                        let _ = shutdown_rx.wait_for(|stop| *stop).await;
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!(error = %e, "Metrics endpoint failed");
                    }
                    info!("Metrics endpoint stopped");
                });
                *self.task.lock() = Some(handle);

                Ok::<_, crate::error::Error>(local)
            })
            .await?;

        Ok(*bound)
    }

    /// Address the server is bound to, if started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
