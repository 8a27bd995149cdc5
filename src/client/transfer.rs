//! # Resilient Transfer Client
//!
//! Every outbound HTTP exchange (device CGI calls, face image downloads) goes
//! through [`TransferClient`], which adds a per-attempt deadline and retries
//! with exponential backoff plus jitter.
//!
//! ## Retry classification
//!
//! - Network failures (reset, DNS, connect error, timeout) are retried
//! - HTTP 429 and 5xx are retried; the body is always read to the end first
//! - Any other status is returned to the caller untouched
//!
//! Attempt `i` (0-indexed) that fails waits `min(base * 2^i, cap) + jitter`
//! before the next one. Once `max_retries` is used up the last error is returned.
//!
//! This layer knows nothing about digest auth or terminals: it moves one
//! buffered request/response pair per attempt.

use bytes::Bytes;
use log::{debug, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use std::error::Error as _;
use std::time::Duration;
use tokio::time::sleep;

use crate::common::config::TransferConfig;
use crate::common::error::{SyncError, SyncResult};

/// Longest response body kept for diagnostics.
pub const MAX_BODY_PREVIEW: usize = 2000;

const IMAGE_ACCEPT: &str = "image/*,application/octet-stream;q=0.8,*/*;q=0.5";
const USER_AGENT: &str = concat!("terminal-sync/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Backoff schedule for one logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay after attempt 0
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// `min(base * 2^attempt, cap)`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// An owned, replayable HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// POST with a JSON body.
    pub fn post_json<T: Serialize>(url: Url, body: &T) -> SyncResult<Self> {
        let payload =
            serde_json::to_vec(body).map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        Ok(Self::new(Method::POST, url)
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=UTF-8"),
            )
            .with_body(payload))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Path plus query, as used in the digest `uri` field.
    pub fn uri(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    fn carries_body(&self) -> bool {
        !self.body.is_empty() || !matches!(self.method, Method::GET | Method::HEAD)
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body text truncated for logs and error messages.
    pub fn preview(&self) -> String {
        truncate_body(&self.text())
    }
}

/// Truncates a body to [`MAX_BODY_PREVIEW`] characters.
pub fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_BODY_PREVIEW {
        return body.to_string();
    }
    let head: String = body.chars().take(MAX_BODY_PREVIEW).collect();
    format!("{}…[truncated]", head)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Maps a reqwest failure onto the sync taxonomy.
fn classify_error(err: reqwest::Error) -> SyncError {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    if err.is_builder() {
        SyncError::Client(message)
    } else if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        SyncError::transient(message)
    } else {
        SyncError::Client(message)
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// HTTP client with per-attempt deadlines and retry/backoff.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    timeout: Duration,
}

impl TransferClient {
    /// Builds a client from the `[transfer]` configuration section.
    ///
    /// # Errors
    /// - `Client` if the TLS backend cannot be initialised
    pub fn new(config: &TransferConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Client(e.to_string()))?;

        Ok(Self {
            http,
            policy: RetryPolicy::from_config(config),
            timeout: config.timeout(),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` with the configured retry count and deadline.
    pub async fn send(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        self.fetch_with_retry(request, self.policy.max_retries, self.timeout)
            .await
    }

    /// Sends `request`, making at most `max_retries + 1` attempts.
    ///
    /// # Returns
    /// - `Ok(HttpResponse)`: any response that is not 429/5xx, including 4xx
    /// - `Err(Transient | Timeout)`: the last retryable failure once retries ran out
    /// - `Err(..)`: a non-retryable failure, immediately
    pub async fn fetch_with_retry(
        &self,
        request: &HttpRequest,
        max_retries: u32,
        timeout: Duration,
    ) -> SyncResult<HttpResponse> {
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.policy.delay_for_attempt(attempt - 1);
                debug!(
                    "🔄 Retry {}/{} for {} {} in {:?}",
                    attempt, max_retries, request.method, request.url, delay
                );
                sleep(delay).await;
            }

            match self.attempt(request, timeout).await {
                Ok(response) if is_retryable_status(response.status) => {
                    warn!(
                        "{} {} answered {} (attempt {}/{})",
                        request.method,
                        request.url,
                        response.status,
                        attempt + 1,
                        max_retries + 1
                    );
                    last_error = Some(SyncError::transient_status(response.status.as_u16()));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "{} {} failed (attempt {}/{}): {}",
                        request.method,
                        request.url,
                        attempt + 1,
                        max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::transient("no attempt was made")))
    }

    /// Downloads `url` and returns the body bytes.
    ///
    /// # Errors
    /// - `InvalidInput` if the URL does not parse
    /// - `Http` for a non-retryable, non-2xx status
    /// - `Transient` / `Timeout` once retries ran out
    pub async fn fetch_buffer_with_retry(&self, url: &str, retries: u32) -> SyncResult<Bytes> {
        let url = Url::parse(url)
            .map_err(|e| SyncError::InvalidInput(format!("invalid image url {:?}: {}", url, e)))?;
        let request =
            HttpRequest::get(url).with_header(ACCEPT, HeaderValue::from_static(IMAGE_ACCEPT));

        let response = self
            .fetch_with_retry(&request, retries, self.timeout)
            .await?;
        if !response.is_success() {
            return Err(SyncError::Http {
                status: response.status.as_u16(),
                body: response.preview(),
            });
        }
        Ok(response.body)
    }

    /// One request/response exchange under `timeout`, body fully read.
    async fn attempt(&self, request: &HttpRequest, timeout: Duration) -> SyncResult<HttpResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if request.carries_body() {
            builder = builder.body(request.body.clone());
        }

        let exchange = async {
            let response = builder.send().await.map_err(classify_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify_error)?;
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout.as_millis() as u64)),
        }
    }
}
