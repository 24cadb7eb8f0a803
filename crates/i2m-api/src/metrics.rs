//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "i2m_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "i2m_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "i2m_http_requests_in_flight";

    // SSE metrics
    pub const SSE_CONNECTIONS_TOTAL: &str = "i2m_sse_connections_total";
    pub const SSE_CONNECTIONS_ACTIVE: &str = "i2m_sse_connections_active";
    pub const SSE_EVENTS_SENT: &str = "i2m_sse_events_sent_total";

    // Queue metrics
    pub const QUEUE_LENGTH: &str = "i2m_queue_length";
    pub const QUEUE_DLQ_LENGTH: &str = "i2m_queue_dlq_length";
    pub const JOBS_ENQUEUED_TOTAL: &str = "i2m_jobs_enqueued_total";
    pub const STALE_JOBS_RECOVERED_TOTAL: &str = "i2m_stale_jobs_recovered_total";

    // Upload metrics
    pub const FILES_UPLOADED_TOTAL: &str = "i2m_files_uploaded_total";
    pub const UPLOAD_BYTES_TOTAL: &str = "i2m_upload_bytes_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "i2m_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a new SSE stream and bump the active gauge.
pub fn record_sse_opened() {
    counter!(names::SSE_CONNECTIONS_TOTAL).increment(1);
    gauge!(names::SSE_CONNECTIONS_ACTIVE).increment(1.0);
}

/// Drop the active SSE gauge.
pub fn record_sse_closed() {
    gauge!(names::SSE_CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an SSE event sent to a client.
pub fn record_sse_event(event_type: &str) {
    let labels = [("type", event_type.to_string())];
    counter!(names::SSE_EVENTS_SENT, &labels).increment(1);
}

/// Update queue length gauge.
pub fn set_queue_length(length: u64) {
    gauge!(names::QUEUE_LENGTH).set(length as f64);
}

/// Update DLQ length gauge.
pub fn set_dlq_length(length: u64) {
    gauge!(names::QUEUE_DLQ_LENGTH).set(length as f64);
}

/// Record job enqueued.
pub fn record_job_enqueued(kind: &str, files: usize) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
    counter!(names::FILES_UPLOADED_TOTAL, &labels).increment(files as u64);
}

/// Record uploaded bytes.
pub fn record_upload_bytes(bytes: u64) {
    counter!(names::UPLOAD_BYTES_TOTAL).increment(bytes);
}

/// Record a stale job moved to failed.
pub fn record_stale_job_recovered() {
    counter!(names::STALE_JOBS_RECOVERED_TOTAL).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Sanitize path for metrics labels (remove IDs, etc.).
///
/// UUIDs and numbers become `:id`, anything with an extension becomes
/// `:filename`.
pub fn sanitize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment
            } else if uuid::Uuid::parse_str(segment).is_ok()
                || segment.chars().all(|c| c.is_ascii_digit())
            {
                ":id"
            } else if segment.contains('.') {
                ":filename"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
