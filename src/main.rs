use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::error::TollgateError;
use tollgate::http::{health_router, HttpServer};
use tollgate::metrics;
use tollgate::ratelimit::{IdentityResolver, RateLimitLayer};
use tollgate::store::{CounterStore, MemoryStore, RedisStore};

/// Edge rate limiting service for HTTP APIs.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "tollgate=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    info!("Starting Tollgate Edge Rate Limiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Invalid configuration refuses to start.
    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        environment = ?config.rate_limiting.environment,
        "Configuration loaded"
    );

    let metrics_handle = metrics::setup_metrics_recorder()?;

    // Select the counter store backend
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().ok_or_else(|| {
                TollgateError::Config("redis backend selected but no redis_url configured".into())
            })?;
            let store = RedisStore::connect(url, config.store.key_prefix.clone()).await?;
            info!("Connected to Redis counter store");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            info!("Using in-memory counter store");
            Arc::new(MemoryStore::new(config.store.sweep_interval()))
        }
    };

    let layer = RateLimitLayer::with_retry(
        store,
        config.rate_limiting.policy_table()?,
        IdentityResolver::new(config.rate_limiting.trusted_ips.clone()),
        config.store.retry_policy(),
    );
    info!("Rate limiter initialized");

    let router = health_router().merge(metrics::metrics_router(metrics_handle));
    let server = HttpServer::new(config.server.listen_addr, router, layer);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate Edge Rate Limiter stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
