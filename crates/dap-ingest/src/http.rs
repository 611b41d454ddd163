//! HTTP client construction and retry policy

use crate::config::HttpConfig;
use crate::error::{IngestError, Result};
use crate::models::SourceDescriptor;
use reqwest::{redirect, Client, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const MAX_REDIRECTS: usize = 10;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
    /// Total attempts, the first one included
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Policy with millisecond delays, for tests against local servers
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial: Duration::from_millis(1),
            factor: 1,
            cap: Duration::from_millis(1),
            max_attempts,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.saturating_pow(exponent);
        self.initial.saturating_mul(multiplier).min(self.cap)
    }
}

/// Client honouring the source's timeout overrides
pub fn client_for(source: &SourceDescriptor, http: &HttpConfig) -> Result<Client> {
    let connect = source.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    let read = source.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS);

    Client::builder()
        .user_agent(&http.user_agent)
        .connect_timeout(Duration::from_secs(connect))
        .read_timeout(Duration::from_secs(read))
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .map_err(|e| IngestError::ConfigMalformed(format!("HTTP client for '{}': {}", source.name, e)))
}

/// Send a GET and classify non-success statuses
pub async fn get(client: &Client, url: &str) -> Result<Response> {
    let response = client.get(url).send().await?;
    ensure_success(response, url)
}

/// Send a HEAD; `None` when the server does not implement the method
pub async fn head_if_supported(client: &Client, url: &str) -> Result<Option<Response>> {
    let response = client.head(url).send().await?;
    match response.status() {
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => Ok(None),
        _ => ensure_success(response, url).map(Some),
    }
}

/// Run `attempt` until it succeeds, fails for good or the budget is spent
///
/// Retryable errors back off per `policy`; cancellation is honoured both
/// while an attempt is in flight and during the backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    url: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            result = attempt() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retries + 1 < policy.max_attempts => {
                retries += 1;
                let delay = policy.delay(retries);
                warn!(
                    url,
                    error = %err,
                    attempt = retries,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                    _ = tokio::time::sleep(delay) => {},
                }
            },
            Err(err) => return Err(err),
        }
    }
}

fn ensure_success(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(IngestError::from_status(status, url))
    }
}

/// Parse a `Last-Modified` header value (RFC 2822 / IMF-fixdate)
pub fn last_modified(response: &Response) -> Option<chrono::DateTime<chrono::Utc>> {
    let value = response.headers().get(reqwest::header::LAST_MODIFIED)?.to_str().ok()?;
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}
