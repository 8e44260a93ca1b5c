//! Tollgate - Edge Rate Limiting Service
//!
//! This crate implements the request admission layer that runs in front of
//! every API route. Each request is resolved to a stable client identity,
//! matched to a route-class policy by path prefix, counted in a shared
//! counter store, and either passed through with rate limit headers
//! attached or terminated with a 429. When the counter store is
//! unreachable the limiter fails open rather than blocking traffic.

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod store;
