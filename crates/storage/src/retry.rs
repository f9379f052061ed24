//! Bounded exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use zarr_common::{Result, ZarrError};

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = 1 + max_retries.
    pub max_retries: u32,
    /// Delay before the first retry (doubles each retry).
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Run `attempt_fn` until it succeeds, fails permanently, or the retry
/// budget is spent.
///
/// Only [`ZarrError::is_retryable`] errors are retried. Once the budget is
/// exhausted the last transient error is escalated to
/// [`ZarrError::EndpointUnreachable`]. Every other error is returned as is.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                if attempt > policy.max_retries {
                    return Err(ZarrError::EndpointUnreachable {
                        key: key.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }

                warn!(
                    key,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}
