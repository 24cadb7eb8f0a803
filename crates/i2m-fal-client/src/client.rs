//! FAL queue API client.
//!
//! Requests go through the queue: submit returns a request ID, the status
//! endpoint is polled until the request completes, then the result is
//! fetched. Transient failures are retried with backoff.

use std::time::{Duration, Instant};

use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, info_span, warn, Instrument};

use i2m_models::GenerationOptions;

use crate::error::{FalError, FalResult};
use crate::metrics::{record_generation, record_request};
use crate::retry::{with_retry, RetryConfig};
use crate::types::{
    GeneratedModel, GenerationUpdate, ImageInput, QueueState, QueueStatus, SubmitResponse,
    TripoRequest, TripoResult,
};

pub const DEFAULT_QUEUE_URL: &str = "https://queue.fal.run";
pub const DEFAULT_MODEL: &str = "tripo3d/tripo/v2.5/image-to-3d";

/// FAL client configuration.
#[derive(Debug, Clone)]
pub struct FalClientConfig {
    /// API key sent as `Authorization: Key <key>`
    pub api_key: String,
    /// Queue API base URL
    pub queue_url: String,
    /// Model path under the queue URL
    pub model: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Delay between status polls
    pub poll_interval: Duration,
    /// Give up on a request after this long
    pub max_wait: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl FalClientConfig {
    /// Config with default endpoints and timings.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            queue_url: DEFAULT_QUEUE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(600),
            retry: RetryConfig::default(),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> FalResult<Self> {
        let api_key = std::env::var("FAL_KEY")
            .map_err(|_| FalError::config("FAL_KEY must be set to generate models"))?;
        if api_key.trim().is_empty() {
            return Err(FalError::config("FAL_KEY cannot be empty"));
        }

        let queue_url =
            std::env::var("FAL_QUEUE_URL").unwrap_or_else(|_| DEFAULT_QUEUE_URL.to_string());
        url::Url::parse(&queue_url)
            .map_err(|e| FalError::config(format!("Invalid FAL_QUEUE_URL: {}", e)))?;

        let secs = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };

        Ok(Self {
            api_key,
            queue_url,
            model: std::env::var("FAL_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            timeout: secs("FAL_TIMEOUT_SECS", 60),
            connect_timeout: secs("FAL_CONNECT_TIMEOUT_SECS", 10),
            poll_interval: secs("FAL_POLL_INTERVAL_SECS", 2),
            max_wait: secs("FAL_MAX_WAIT_SECS", 600),
            retry: RetryConfig::from_env(),
        })
    }

    pub fn with_queue_url(mut self, url: impl Into<String>) -> Self {
        self.queue_url = url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// FAL queue API client.
#[derive(Clone)]
pub struct FalClient {
    http: Client,
    config: FalClientConfig,
}

impl FalClient {
    /// Create a new FAL client.
    pub fn new(config: FalClientConfig) -> FalResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("i2m-fal-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FalError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> FalResult<Self> {
        Self::new(FalClientConfig::from_env()?)
    }

    pub fn config(&self) -> &FalClientConfig {
        &self.config
    }

    fn base(&self) -> &str {
        self.config.queue_url.trim_end_matches('/')
    }

    fn submit_url(&self) -> String {
        format!("{}/{}", self.base(), self.config.model)
    }

    fn status_url(&self, request_id: &str) -> String {
        format!("{}/{}/requests/{}/status", self.base(), self.config.model, request_id)
    }

    fn response_url(&self, request_id: &str) -> String {
        format!("{}/{}/requests/{}", self.base(), self.config.model, request_id)
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.config.api_key)
    }

    /// Submit an image to the queue.
    pub async fn submit(
        &self,
        image_url: &str,
        options: &GenerationOptions,
    ) -> FalResult<SubmitResponse> {
        let url = self.submit_url();
        let body = TripoRequest::new(image_url, options);
        let (url, body) = (&url, &body);

        self.execute_request("submit", async {
            with_retry(&self.config.retry, "submit", || async move {
                let response = self
                    .http
                    .post(url)
                    .header(AUTHORIZATION, self.auth_header())
                    .json(body)
                    .send()
                    .await?;
                Self::parse_json(response).await
            })
            .await
        })
        .await
    }

    /// Poll the status of a request.
    pub async fn status(&self, request_id: &str) -> FalResult<QueueStatus> {
        self.status_at(&self.status_url(request_id)).await
    }

    async fn status_at(&self, url: &str) -> FalResult<QueueStatus> {
        self.execute_request("status", async {
            with_retry(&self.config.retry, "status", || async move {
                let response = self
                    .http
                    .get(url)
                    .query(&[("logs", "1")])
                    .header(AUTHORIZATION, self.auth_header())
                    .send()
                    .await?;
                Self::parse_json(response).await
            })
            .await
        })
        .await
    }

    /// Fetch the result of a completed request.
    pub async fn result(&self, request_id: &str) -> FalResult<TripoResult> {
        self.result_at(&self.response_url(request_id)).await
    }

    async fn result_at(&self, url: &str) -> FalResult<TripoResult> {
        self.execute_request("result", async {
            with_retry(&self.config.retry, "result", || async move {
                let response = self
                    .http
                    .get(url)
                    .header(AUTHORIZATION, self.auth_header())
                    .send()
                    .await?;
                Self::parse_json(response).await
            })
            .await
        })
        .await
    }

    /// Download a generated file. FAL file URLs are public, so no key is sent.
    pub async fn download(&self, url: &str) -> FalResult<Vec<u8>> {
        self.execute_request("download", async {
            with_retry(&self.config.retry, "download", || async move {
                let response = self.http.get(url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Self::error_from_response(status, response).await);
                }
                Ok(response.bytes().await?.to_vec())
            })
            .await
        })
        .await
    }

    /// Run one image through the model.
    ///
    /// Submits, polls until the request completes and fetches the result.
    /// Every state change is sent on `updates`; a dropped receiver is ignored.
    pub async fn generate(
        &self,
        image: &ImageInput,
        options: &GenerationOptions,
        updates: UnboundedSender<GenerationUpdate>,
    ) -> FalResult<GeneratedModel> {
        let started = Instant::now();
        let result = self.run_generation(image, options, &updates, started).await;
        record_generation(result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    async fn run_generation(
        &self,
        image: &ImageInput,
        options: &GenerationOptions,
        updates: &UnboundedSender<GenerationUpdate>,
        started: Instant,
    ) -> FalResult<GeneratedModel> {
        let submitted = self.submit(&image.to_data_uri(), options).await?;
        let request_id = submitted.request_id.clone();
        info!(request_id = %request_id, "Submitted image to FAL");
        updates
            .send(GenerationUpdate::Submitted {
                request_id: request_id.clone(),
            })
            .ok();

        let status_url = submitted
            .status_url
            .clone()
            .unwrap_or_else(|| self.status_url(&request_id));
        let mut response_url = submitted
            .response_url
            .clone()
            .unwrap_or_else(|| self.response_url(&request_id));

        let mut polls = 0u32;
        let mut last_position = None;
        loop {
            if started.elapsed() > self.config.max_wait {
                warn!(request_id = %request_id, "Gave up waiting for FAL request");
                return Err(FalError::Timeout(self.config.max_wait.as_secs()));
            }

            let status = self.status_at(&status_url).await?;
            match status.status {
                QueueState::InQueue => {
                    if last_position != Some(status.queue_position) {
                        last_position = Some(status.queue_position);
                        updates
                            .send(GenerationUpdate::Queued {
                                position: status.queue_position,
                            })
                            .ok();
                    }
                }
                QueueState::InProgress => {
                    polls += 1;
                    updates
                        .send(GenerationUpdate::InProgress {
                            polls,
                            log: status.last_log().map(str::to_string),
                        })
                        .ok();
                }
                QueueState::Completed => {
                    if let Some(url) = status.response_url {
                        response_url = url;
                    }
                    break;
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        updates.send(GenerationUpdate::Completed).ok();

        let result = self.result_at(&response_url).await?;
        let model = result
            .primary_model()
            .cloned()
            .ok_or_else(|| FalError::generation_failed("result contained no model file"))?;

        debug!(request_id = %request_id, model_url = %model.url, "FAL request completed");
        Ok(GeneratedModel {
            request_id,
            model,
            rendered_image: result.rendered_image,
        })
    }

    /// Decode a JSON body or map the HTTP failure.
    async fn parse_json<T: DeserializeOwned>(response: Response) -> FalResult<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from_response(status, response).await);
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            FalError::invalid_response(format!("{}: {}", e, body.chars().take(200).collect::<String>()))
        })
    }

    async fn error_from_response(status: StatusCode, response: Response) -> FalError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header = response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok());
            return FalError::RateLimited(retry_after_ms(header));
        }

        let body = response.text().await.unwrap_or_default();
        FalError::from_http_status(status.as_u16(), body)
    }

    async fn execute_request<T, F>(&self, operation: &str, fut: F) -> FalResult<T>
    where
        F: std::future::Future<Output = FalResult<T>>,
    {
        let span = info_span!("fal_request", operation = %operation, model = %self.config.model);

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }
}

/// Milliseconds to wait from a `Retry-After` header in seconds. Defaults to 1s.
fn retry_after_ms(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_ms() {
        assert_eq!(retry_after_ms(Some("3")), 3000);
        assert_eq!(retry_after_ms(Some("0")), 0);
        assert_eq!(retry_after_ms(None), 1000);
        assert_eq!(retry_after_ms(Some("soon")), 1000);
        // Huge values clamp instead of overflowing
        assert_eq!(retry_after_ms(Some(&u64::MAX.to_string())), u64::MAX);
    }

    #[test]
    fn test_urls() {
        let client = FalClient::new(
            FalClientConfig::new("secret").with_queue_url("https://queue.example.com/"),
        )
        .unwrap();
        assert_eq!(
            client.submit_url(),
            "https://queue.example.com/tripo3d/tripo/v2.5/image-to-3d"
        );
        assert_eq!(
            client.status_url("abc"),
            "https://queue.example.com/tripo3d/tripo/v2.5/image-to-3d/requests/abc/status"
        );
        assert_eq!(client.auth_header(), "Key secret");
    }

    #[test]
    fn test_config_defaults() {
        let config = FalClientConfig::new("k");
        assert_eq!(config.queue_url, DEFAULT_QUEUE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }
}
