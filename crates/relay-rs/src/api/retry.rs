//! Backoff for OpenRouter calls made by the agent and summarizer adapters.
//!
//! Only failures [`is_transient`] recognizes in the client's error messages
//! are retried: HTTP 408, 429 and 5xx statuses, and requests that never got a
//! complete response.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Spread delays over 50-100% of the backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Wait before retry number `attempt` (0 for the first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = backoff_ms.min(self.max_delay_ms as f64);
        let scale = if self.jitter {
            1.0 - f64::from((attempt * 7 + 3) % 6) / 10.0
        } else {
            1.0
        };
        Duration::from_millis((capped_ms * scale) as u64)
    }
}

/// HTTP status in an `OpenRouter API HTTP <status>: ...` message.
fn http_status(message: &str) -> Option<u16> {
    let (_, rest) = message.split_once("HTTP ")?;
    rest.get(..3)?.parse().ok()
}

/// Whether a client error message describes a failure worth retrying.
pub fn is_transient(message: &str) -> bool {
    match http_status(message) {
        Some(status) => status == 408 || status == 429 || (500..600).contains(&status),
        None => {
            message.starts_with("request failed:") || message.starts_with("failed to read response:")
        }
    }
}

/// Retry an async call with exponential backoff while its error is
/// retryable.
pub async fn retry_api_call<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < config.max_retries && e.is_retryable() => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Transient API error (attempt {}/{}): {e}. Retrying in {delay:?}...",
                    attempt + 1,
                    config.max_retries,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
