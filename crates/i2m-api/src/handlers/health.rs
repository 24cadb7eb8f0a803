//! Liveness and readiness probes.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "i2m-api",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Probe {
    Ok,
    Error,
}

/// Outcome of one dependency probe.
#[derive(Debug, Serialize)]
pub struct DependencyCheck {
    pub status: Probe,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub redis: DependencyCheck,
    pub storage: DependencyCheck,
}

async fn timed<F, E>(probe: F) -> DependencyCheck
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    let started = Instant::now();
    let result = probe.await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => DependencyCheck {
            status: Probe::Ok,
            latency_ms,
            error: None,
        },
        Err(e) => DependencyCheck {
            status: Probe::Error,
            latency_ms,
            error: Some(e.to_string()),
        },
    }
}

/// GET /ready
///
/// 503 when Redis or the storage directories are unreachable.
pub async fn ready(State(state): State<AppState>) -> Response {
    let (redis, storage) = tokio::join!(
        timed(state.jobs.ping()),
        timed(state.storage.check_connectivity())
    );

    let ready = redis.status == Probe::Ok && storage.status == Probe::Ok;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadinessResponse {
            ready,
            redis,
            storage,
        }),
    )
        .into_response()
}
