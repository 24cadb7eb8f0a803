//! API configuration.

use std::net::IpAddr;
use std::time::Duration;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Redis URL
    pub redis_url: String,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Bearer key for user routes; `None` disables auth on user routes
    pub api_key: Option<String>,
    /// Bearer key for admin routes; `None` disables the admin surface
    pub admin_api_key: Option<String>,
    /// General requests per minute per client IP
    pub rate_limit_per_minute: u32,
    /// Upload requests per minute per client IP
    pub upload_rate_limit_per_minute: u32,
    /// Reverse proxies whose `X-Forwarded-For` and `X-Real-IP` are believed
    pub trusted_proxies: Vec<IpAddr>,
    /// Max size of one uploaded image
    pub max_upload_bytes: usize,
    /// Max number of files in one batch upload
    pub max_files_per_batch: usize,
    /// Poll fallback interval for SSE streams
    pub sse_poll_interval: Duration,
    /// Max lifetime of one SSE stream
    pub sse_max_duration: Duration,
    /// Concurrent SSE streams allowed per session
    pub max_streams_per_session: usize,
    /// Environment (development/production)
    pub environment: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            redis_url: "redis://localhost:6379".to_string(),
            cors_origins: vec!["*".to_string()],
            api_key: None,
            admin_api_key: None,
            rate_limit_per_minute: 60,
            upload_rate_limit_per_minute: 10,
            trusted_proxies: Vec::new(),
            max_upload_bytes: 10 * 1024 * 1024, // 10MB
            max_files_per_batch: 25,
            sse_poll_interval: Duration::from_secs(2),
            sse_max_duration: Duration::from_secs(30 * 60),
            max_streams_per_session: 5,
            environment: "development".to_string(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            api_key: non_empty_var("API_KEY"),
            admin_api_key: non_empty_var("ADMIN_API_KEY"),
            rate_limit_per_minute: std::env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_per_minute),
            upload_rate_limit_per_minute: std::env::var("UPLOAD_RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.upload_rate_limit_per_minute),
            trusted_proxies: std::env::var("TRUSTED_PROXIES")
                .map(|s| parse_ip_list(&s))
                .unwrap_or(defaults.trusted_proxies),
            max_upload_bytes: std::env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_upload_bytes),
            max_files_per_batch: std::env::var("MAX_FILES_PER_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_files_per_batch),
            sse_poll_interval: Duration::from_secs(
                std::env::var("SSE_POLL_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            ),
            sse_max_duration: Duration::from_secs(
                std::env::var("SSE_MAX_DURATION")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30 * 60),
            ),
            max_streams_per_session: std::env::var("MAX_STREAMS_PER_SESSION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_streams_per_session),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }

    /// Request body limit: a full batch plus room for the multipart framing
    /// and option fields.
    pub fn max_body_size(&self) -> usize {
        self.max_upload_bytes
            .saturating_mul(self.max_files_per_batch.max(1))
            .saturating_add(1024 * 1024)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Comma-separated IP addresses. Entries that do not parse are dropped.
fn parse_ip_list(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}
