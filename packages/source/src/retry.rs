//! HTTP retry for transient provider errors.
//!
//! Adapters call [`send_json`] instead of `RequestBuilder::send()` so every
//! provider request is retried with exponential backoff on connection
//! failures, timeouts, HTTP 429, and HTTP 5xx. Other 4xx responses are
//! permanent and returned immediately. Once retries are exhausted the error
//! propagates and aborts the harvest run.
//!
//! ```ignore
//! let body = retry::send_json(&RetryPolicy::default(), || {
//!     client.get(&url).query(&params)
//! })
//! .await?;
//! ```

use std::time::Duration;

use reqwest::StatusCode;

use crate::SourceError;

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 300;

/// Retry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each following retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Five retries starting at two seconds (2s, 4s, 8s, 16s, 32s).
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Whether an HTTP status is worth retrying.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Whether a transport error is likely transient.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

/// Sends the request built by `build_request` and parses the body as JSON.
///
/// `build_request` is called once per attempt because request builders are
/// consumed by `send()`.
///
/// # Errors
///
/// Returns [`SourceError`] if every attempt fails, the provider answers
/// with a permanent error status, or the body is not JSON.
pub async fn send_json<F>(
    policy: &RetryPolicy,
    build_request: F,
) -> Result<serde_json::Value, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let response = send_with_retry(policy, &build_request).await?;
    let url = response.url().to_string();
    let text = response.text().await?;

    serde_json::from_str(&text).map_err(|e| {
        let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
        log::error!(
            "JSON parse failed\n  url: {url}\n  received: {} bytes\n  error: {e}\n  body preview: {preview}",
            text.len()
        );
        SourceError::Json(e)
    })
}

async fn send_with_retry<F>(
    policy: &RetryPolicy,
    build_request: &F,
) -> Result<reqwest::Response, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let mut attempt = 0;

    loop {
        let retries_left = attempt < policy.max_retries;

        match build_request().send().await {
            Err(e) if is_transient(&e) && retries_left => {
                log::warn!("  transient error: {e}");
            }
            Err(e) => return Err(SourceError::Http(e)),
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && retries_left {
                    log::warn!("  HTTP {status} from {}", response.url());
                } else if status.is_client_error() || status.is_server_error() {
                    return Err(SourceError::Response {
                        message: format!("HTTP {status} from {}", response.url()),
                    });
                } else {
                    return Ok(response);
                }
            }
        }

        attempt += 1;
        let delay = policy.delay(attempt);
        log::warn!("  retry {attempt}/{} in {delay:?}...", policy.max_retries);
        tokio::time::sleep(delay).await;
    }
}
