//! Explicit stage outcomes and bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::{defaults, Error, Result};

/// Result of one attempt at a stage operation.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    /// Worth another attempt (network blip, 5xx, rate limit).
    Retryable(Error),
    /// Retrying cannot help.
    Permanent(Error),
}

impl<T> StageOutcome<T> {
    /// Classify a plain result using [`Error::is_retryable`].
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => StageOutcome::Ok(value),
            Err(e) if e.is_retryable() => StageOutcome::Retryable(e),
            Err(e) => StageOutcome::Permanent(e),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            StageOutcome::Ok(value) => Ok(value),
            StageOutcome::Retryable(e) | StageOutcome::Permanent(e) => Err(e),
        }
    }
}

impl<T> From<Result<T>> for StageOutcome<T> {
    fn from(result: Result<T>) -> Self {
        StageOutcome::from_result(result)
    }
}

/// Bounded exponential backoff with jitter.
///
/// The delay after failed attempt `n` is `base * 2^(n-1)` plus up to
/// `jitter_ratio` of that step, capped at `max_delay`. With a ratio below 1
/// consecutive delays strictly increase until the cap is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
            jitter_ratio: defaults::RETRY_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 0.99);
        self
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let step = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter = if self.jitter_ratio > 0.0 && !step.is_zero() {
            let max_jitter = step.mul_f64(self.jitter_ratio);
            let nanos = max_jitter.as_nanos() as u64;
            if nanos == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
            }
        } else {
            Duration::ZERO
        };
        (step + jitter).min(self.max_delay)
    }

    /// Delay after a failure, preferring the upstream's retry hint.
    pub fn delay_after(&self, attempt: u32, error: &Error) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for(attempt),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// `op` receives the 1-based attempt number. Permanent errors are returned
/// unchanged; exhaustion yields [`Error::RetriesExhausted`].
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StageOutcome<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            StageOutcome::Ok(value) => return Ok(value),
            StageOutcome::Permanent(e) => {
                debug!(op = op_name, attempt, error = %e, "Permanent failure, not retrying");
                return Err(e);
            }
            StageOutcome::Retryable(e) => {
                if attempt >= max_attempts {
                    warn!(op = op_name, attempt, error = %e, "Retries exhausted");
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                let delay = policy.delay_after(attempt, &e);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
