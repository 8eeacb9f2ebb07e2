//! Backoff calculator and retry loop for step execution.
//!
//! `Backoff` maps an attempt number and a `RetryPolicy` to a delay, and
//! decides whether a handler error is worth retrying. `run_with_retry` drives
//! one step: attempt 0 runs immediately, each later attempt sleeps first.

use std::future::Future;
use std::time::Duration;

use stepwise_types::workflow::{BackoffStrategy, RetryPolicy};

use crate::handler::{ErrorKind, StepError};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Stateless backoff calculator.
///
/// No internal state, all logic is in associated functions that take the
/// policy as a parameter.
pub struct Backoff;

impl Backoff {
    /// Un-jittered, un-capped delay in milliseconds for `attempt`.
    ///
    /// Attempt 0 is the first try and never waits. Saturates instead of
    /// overflowing for very large attempt numbers.
    pub fn base_delay_ms(attempt: u32, policy: &RetryPolicy) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let base = policy.base_delay_ms;
        match policy.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        }
    }

    /// Delay before `attempt` given a jitter sample in [0, 1].
    ///
    /// `delay = base + base * jitter_factor * sample`, clamped to `max_delay_ms`.
    pub fn delay_with_jitter(attempt: u32, policy: &RetryPolicy, sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = Self::base_delay_ms(attempt, policy) as f64;
        let jitter = policy.jitter_factor.clamp(0.0, 1.0);
        let sample = sample.clamp(0.0, 1.0);
        let delay = (base + base * jitter * sample).min(policy.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Delay before `attempt` with a random jitter sample.
    pub fn delay(attempt: u32, policy: &RetryPolicy) -> Duration {
        Self::delay_with_jitter(attempt, policy, rand::random::<f64>())
    }

    /// Whether `error` should be retried under `policy`.
    ///
    /// Tagged errors decide for themselves. Untagged errors are retryable when
    /// any policy pattern is a case-insensitive substring of their name or message.
    pub fn is_retryable(error: &StepError, policy: &RetryPolicy) -> bool {
        match error.kind {
            ErrorKind::Retryable => true,
            ErrorKind::Fatal => false,
            ErrorKind::Unclassified => Self::matches_pattern(error, &policy.retryable_errors),
        }
    }

    /// Case-insensitive substring match of `patterns` against the error text.
    pub fn matches_pattern(error: &StepError, patterns: &[String]) -> bool {
        let name = error.name.to_lowercase();
        let message = error.message.to_lowercase();
        patterns
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.to_lowercase())
            .any(|p| name.contains(&p) || message.contains(&p))
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Result of driving an operation through the retry loop.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StepError>,
    /// Total invocations, including the first.
    pub attempts: u32,
}

impl<T> Attempted<T> {
    /// Retries consumed (attempts after the first).
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `op` with retry.
///
/// Attempts are numbered from 0 through `max_retries`. Before every attempt
/// after the first, sleeps for `Backoff::delay(attempt, policy)`. A
/// non-retryable error stops the loop immediately regardless of budget.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    max_retries: u32,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            let delay = Backoff::delay(attempt, policy);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = Backoff::is_retryable(&err, policy);
                if !retryable || attempt >= max_retries {
                    if retryable {
                        tracing::warn!(attempts = attempt + 1, error = %err, "retry budget exhausted");
                    }
                    return Attempted {
                        result: Err(err),
                        attempts: attempt + 1,
                    };
                }
                tracing::warn!(attempt, max_retries, error = %err, "retryable step error");
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
