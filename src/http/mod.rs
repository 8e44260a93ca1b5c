//! HTTP admission surface.

mod server;

pub use server::{health_router, HttpServer};
