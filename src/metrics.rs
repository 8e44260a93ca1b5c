//! Prometheus metrics setup.
//!
//! Rate limit decisions and store degradations are recorded through the
//! `metrics` facade; this module installs the Prometheus recorder and
//! exposes the scrape endpoint.

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Result, TollgateError};

/// Install the Prometheus recorder and return its render handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|error| TollgateError::Config(format!("failed to install metrics recorder: {error}")))
}

/// Router exposing the `/metrics` scrape endpoint.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}
