//! HTTP server implementation.

use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::RateLimitLayer;

/// HTTP server that fronts a router with the rate limiting layer.
///
/// The wrapped router is an external collaborator: Tollgate only decides
/// whether each request may reach it.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The router with the admission layer installed
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server wrapping `router` with the given layer.
    pub fn new(addr: SocketAddr, router: Router, layer: RateLimitLayer) -> Self {
        Self {
            addr,
            router: router.layer(layer),
        }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");
        axum::serve(listener, self.router).await?;
        Ok(())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await?;
        Ok(())
    }
}

/// Router serving liveness and readiness probes.
pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
