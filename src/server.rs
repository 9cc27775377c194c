//! Liveness and metrics HTTP endpoints.
//!
//! `GET /ping` answers `Ok.` as long as the process is up; it says nothing
//! about registry reachability. `GET /metrics` serves the Prometheus text format
//! when metrics are enabled.

use std::net::SocketAddr;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::metrics::Metrics;

async fn ping_handler() -> &'static str {
    "Ok."
}

async fn metrics_handler(State(metrics): State<Option<Metrics>>) -> impl IntoResponse {
    let Some(metrics) = metrics else {
        return (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain; charset=utf-8")],
            b"metrics disabled".to_vec(),
        );
    };
    match metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

pub fn router(metrics: Option<Metrics>) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve [`router`] on an already bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Option<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("http server shutting down");
        })
        .await?;
    Ok(())
}

/// Bind `addr` and run the HTTP server until `shutdown` fires.
pub async fn run_http_server(
    addr: SocketAddr,
    metrics: Option<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    serve(listener, metrics, shutdown).await
}
