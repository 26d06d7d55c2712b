//! Connection-level retry for single HTTP round trips.

use anyhow::Result;
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, is_transport_error};

/// Bounds for retrying one HTTP call after connection-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRetry {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff unit.
    pub interval: Duration,
}

impl ConnectionRetry {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Total number of attempts.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the failed attempt `attempt` (0-indexed): linear in the
    /// attempt number, not exponential.
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff(self.interval, attempt)
    }
}

/// `interval * (attempt + 1)`, shared by the connection and task retry layers.
pub fn backoff(interval: Duration, attempt: u32) -> Duration {
    interval.saturating_mul(attempt.saturating_add(1))
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ApiError::Cancelled.into());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApiError::Cancelled.into()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `operation` until it succeeds, fails with something other than
/// [`ApiError::Transport`], or runs out of attempts.
///
/// Exhaustion is reported as [`ApiError::ConnectionExhausted`] carrying the
/// last transport failure. HTTP status errors pass through on first sight.
pub async fn with_connection_retry<F, Fut, T>(
    operation_name: &str,
    policy: &ConnectionRetry,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled.into());
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled.into()),
            outcome = operation() => outcome,
        };

        let e = match outcome {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_transport_error(&e) {
            debug!("{}: non-retryable error: {}", operation_name, e);
            return Err(e);
        }

        if attempt + 1 >= attempts {
            return Err(ApiError::ConnectionExhausted {
                operation: operation_name.to_string(),
                attempts,
                last_error: e.to_string(),
            }
            .into());
        }

        let delay = policy.backoff(attempt);
        warn!(
            "{}: connection error on attempt {}/{} ({}), retrying in {:.2}s...",
            operation_name,
            attempt + 1,
            attempts,
            e,
            delay.as_secs_f64()
        );
        pause(delay, cancel).await?;
        attempt += 1;
    }
}
