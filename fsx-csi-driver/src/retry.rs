//! Bounded exponential backoff for backing-store calls.
//!
//! Only [`ErrorKind::Transient`](crate::ErrorKind::Transient) failures are
//! retried. Any other error is returned on first occurrence, unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;

/// Maximum number of attempts, including the first one
const MAX_ATTEMPTS: u32 = 5;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 200;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 10_000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: f64 = 2.0;
/// Delays are randomized by ± this fraction
const JITTER: f64 = 0.2;
/// Upper bound accepted for `maxBackoffMs`
const BACKOFF_LIMIT_MS: u64 = 3_600_000;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            multiplier: BACKOFF_MULTIPLIER,
            jitter: JITTER,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.maxAttempts must be at least 1".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("retry.multiplier must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry.jitter must be within [0, 1]".to_string());
        }
        if self.max_backoff_ms > BACKOFF_LIMIT_MS {
            return Err(format!("retry.maxBackoffMs must not exceed {}", BACKOFF_LIMIT_MS));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("retry.initialBackoffMs must not exceed retry.maxBackoffMs".to_string());
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    /// Delay before retry number `retry`, randomized by `jitter`.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// Retries `operation` while it fails with a retryable error, up to
/// `policy.max_attempts` attempts in total. Exhausting the budget yields
/// [`Error::RetriesExhausted`] wrapping the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        if attempt >= policy.max_attempts {
            warn!(
                operation = operation_name,
                attempts = attempt,
                error = %error,
                "Operation failed after retries"
            );
            return Err(Error::RetriesExhausted {
                operation: operation_name.to_string(),
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let backoff = policy.delay(attempt);
        warn!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Retryable error, backing off"
        );
        metrics::record_retry(operation_name);

        tokio::time::sleep(backoff).await;
    }
}
