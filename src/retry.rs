//! Bounded exponential backoff for provider calls.
//!
//! Only [`ProviderError::Transient`] is retried. Delays grow as
//! `base × 2^(attempt-1)` and are capped at `max_delay`; after
//! `max_retries` retries the last error is returned to the call site.
//!
//! HTTP responses are classified with [`classify_status`]:
//! - 401 / 403 → [`ProviderError::Auth`]
//! - 429 and 5xx → [`ProviderError::Transient`]
//! - any other 4xx → [`ProviderError::Rejected`]

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            ..Self::default()
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    call = what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Map a non-success HTTP status and body to a [`ProviderError`].
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{} API error {}: {}", provider, status, body);
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::Transient(message),
        s if s >= 500 => ProviderError::Transient(message),
        _ => ProviderError::Rejected(message),
    }
}

/// Send a JSON request and decode a JSON response, classifying failures.
pub async fn send_json(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(provider, status, &body));
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ProviderError::Malformed(format!("{} returned invalid JSON: {}", provider, e)))
}
