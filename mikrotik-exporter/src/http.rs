//! HTTP server for the Prometheus scrape endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::controller::ConnectionState;
use crate::scrape::ScrapeBridge;

/// Body of the root endpoint.
pub const ROOT_TEXT: &str = "Point Prometheus here for your RouterOS statistics\n";

/// Content type of the text exposition format.
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    bridge: ScrapeBridge,
    connection: watch::Receiver<ConnectionState>,
}

/// Create the HTTP router.
fn create_router(
    bridge: ScrapeBridge,
    connection: watch::Receiver<ConnectionState>,
    metrics_path: &str,
) -> Router {
    let state = AppState { bridge, connection };

    Router::new()
        .route("/", get(root_handler))
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root_handler() -> Response {
    (StatusCode::OK, ROOT_TEXT).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.bridge.render();

    (
        StatusCode::OK,
        [("content-type", METRICS_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Ready while a device session is established.
async fn ready_handler(State(state): State<AppState>) -> Response {
    let connection = *state.connection.borrow();

    if connection == ConnectionState::Connected {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not ready - device {}\n", connection.as_str()),
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    bridge: ScrapeBridge,
    connection: watch::Receiver<ConnectionState>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    pub fn new(
        bridge: ScrapeBridge,
        connection: watch::Receiver<ConnectionState>,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            bridge,
            connection,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.bridge, self.connection, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown.borrow_and_update() {
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
