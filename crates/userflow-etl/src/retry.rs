//! Bounded retry with backoff
//!
//! Page fetches and remote-store connections both go through
//! [`retry_with_backoff`]; only the policy and the retryability predicate
//! differ between them.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// How many times to try and how long to wait between tries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Factor applied to the delay after each further failure (1 = fixed)
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier: multiplier.max(1),
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, 1)
    }

    /// Delay to sleep after the given 1-based failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(self.multiplier.saturating_pow(exponent))
    }
}

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Aborted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy runs out of attempts
///
/// There is no sleep after the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(%label, attempt, max_attempts, "Attempting operation");

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => {
                return Err(RetryError::Aborted {
                    attempts: attempt,
                    error: e,
                });
            },
            Err(e) if attempt >= max_attempts => {
                warn!(%label, attempt, max_attempts, error = %e, "All attempts failed");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            },
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    %label,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Attempt failed, retrying in {}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            },
        }
    }
}
