//! Axum HTTP API server.
//!
//! This crate provides:
//! - Image upload and job creation backed by Redis
//! - Task status, results and SSE progress streams
//! - Bearer key auth, rate limiting and security headers
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod security;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::{StaleJobDetector, StreamTracker};
pub use state::AppState;
