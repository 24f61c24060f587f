//! HTTP retry helpers for transient errors.
//!
//! Every portal request goes through [`send`] rather than calling
//! `reqwest::RequestBuilder::send()` directly, so connection failures,
//! timeouts, rate limiting, and gateway errors are retried with
//! exponential backoff.
//!
//! # Usage
//!
//! ```ignore
//! let response = retry::send(&policy, || client.get(&url)).await?;
//! ```
//!
//! Only the statuses in [`RETRYABLE_STATUSES`] are retried. Any other
//! response, including 401 and other 4xx, is returned to the caller on the
//! first attempt so it can decide what the status means.

use std::time::Duration;

use crate::ExtractionError;

/// Statuses worth retrying.
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// How many times and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: crate::DEFAULT_RETRIES,
            backoff_base: crate::DEFAULT_BACKOFF,
        }
    }
}

/// Sends the request built by `build_request`, retrying transient failures.
///
/// The closure is called once per attempt since builders are consumed by
/// `.send()`.
///
/// # Errors
///
/// * [`ExtractionError::RetriesExhausted`] if a transient failure persists
///   through every retry
/// * [`ExtractionError::Http`] for non-transient transport errors
pub async fn send<F>(policy: &RetryPolicy, build_request: F) -> Result<reqwest::Response, ExtractionError>
where
    F: Fn() -> reqwest::RequestBuilder + Sync,
{
    let attempts = policy.retries + 1;
    let mut last = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            log::warn!("  retry {attempt}/{} in {delay:?}...", policy.retries);
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                let err = ExtractionError::Http(e);
                if !err.is_retryable() {
                    return Err(err);
                }
                log::warn!("  transient error: {err}");
                last = err.to_string();
            }
            Ok(response) => {
                let status = response.status();
                if !RETRYABLE_STATUSES.contains(&status.as_u16()) {
                    return Ok(response);
                }
                log::warn!("  HTTP {status} from {}", response.url());
                last = format!("HTTP {status} from {}", response.url());
            }
        }
    }

    Err(ExtractionError::RetriesExhausted { attempts, last })
}

/// Returns `true` if the error is likely transient and worth retrying.
#[must_use]
pub fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            retries: 3,
            backoff_base: Duration::from_millis(800),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(800));
        assert_eq!(policy.delay(2), Duration::from_millis(1600));
        assert_eq!(policy.delay(3), Duration::from_millis(3200));
    }

    #[test]
    fn unauthorized_is_not_retryable() {
        assert!(!RETRYABLE_STATUSES.contains(&401));
        assert!(!RETRYABLE_STATUSES.contains(&403));
        assert!(RETRYABLE_STATUSES.contains(&429));
    }
}
