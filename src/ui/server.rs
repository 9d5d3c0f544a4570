//! Read-only status server

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::error::{Error, Result};
use crate::peers::DiscoveryRegistry;
use crate::ui::handlers;

/// Shared state for handlers
pub struct AppState {
    pub registry: Arc<DiscoveryRegistry>,
    pub required_sample_rate: u32,
    pub started_at: Instant,
}

pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(registry: Arc<DiscoveryRegistry>, required_sample_rate: u32) -> Self {
        Self {
            state: Arc::new(AppState {
                registry,
                required_sample_rate,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/connections", get(handlers::get_connections))
            .route("/api/connections/:name", get(handlers::get_connection))
            .route("/api/devices", get(handlers::get_devices))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn run(
        self,
        addr: SocketAddr,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Status API listening on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(Error::Io)
    }
}
