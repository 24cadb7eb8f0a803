//! API routes.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::admin::{cleanup_files, delete_job, get_job_detail, get_system_info, list_jobs};
use crate::handlers::download::download_file;
use crate::handlers::session::list_session_jobs;
use crate::handlers::status::{get_job_results, get_task_status};
use crate::handlers::stream::stream_task;
use crate::handlers::upload::{upload_batch, upload_image};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, rate_limit_middleware, request_id, request_logging, security_headers,
    RateLimiterCache,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    // Uploads get their own, stricter limiter
    let trusted_proxies = state.config.trusted_proxies.clone();
    let upload_limiter = Arc::new(
        RateLimiterCache::per_minute(state.config.upload_rate_limit_per_minute)
            .with_trusted_proxies(trusted_proxies.clone()),
    );
    let upload_routes = Router::new()
        .route("/upload/image", post(upload_image))
        .route("/upload/batch", post(upload_batch))
        .layer(middleware::from_fn_with_state(
            upload_limiter,
            rate_limit_middleware,
        ));

    let status_routes = Router::new()
        .route("/status/tasks/:job_id", get(get_task_status))
        .route("/status/tasks/:job_id/stream", get(stream_task))
        .route("/status/jobs/:job_id/results", get(get_job_results));

    let download_routes = Router::new()
        // `all` lists the files
        .route("/download/:job_id/:filename", get(download_file));

    let session_routes = Router::new().route("/session/jobs", get(list_session_jobs));

    let admin_routes = Router::new()
        .route("/admin/jobs", get(list_jobs))
        .route("/admin/jobs/:job_id", get(get_job_detail).delete(delete_job))
        .route("/admin/system/info", get(get_system_info))
        .route("/admin/cleanup", post(cleanup_files));

    let rate_limiter = Arc::new(
        RateLimiterCache::per_minute(state.config.rate_limit_per_minute)
            .with_trusted_proxies(trusted_proxies),
    );

    let limited_routes = Router::new()
        .merge(status_routes)
        .merge(download_routes)
        .merge(session_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let api_routes = Router::new()
        .merge(upload_routes)
        .merge(limited_routes)
        .merge(health_routes.clone());

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    let max_body_size = state.config.max_body_size();

    Router::new()
        .nest("/api/v1", api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        // Multipart enforces its own default limit unless overridden
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
