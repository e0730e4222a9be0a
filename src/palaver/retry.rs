use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, sleep};

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failure. Zero keeps it constant.
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_factor: 0,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("Operation '{operation_description}' failed after {attempts_made} attempts. Last error: {last_error}")]
    MaxRetriesExceeded {
        last_error: E,
        operation_description: String,
        attempts_made: u32,
    },
}

/// Runs `attempt_fn` until it succeeds or the policy's attempts are used up.
///
/// `progress_fn` is called before each sleep with the attempt number that just
/// failed, the attempt limit, the upcoming delay, and the error.
pub async fn execute_with_retry<F, Fut, T, E>(
    operation_description: String,
    policy: &RetryPolicy,
    mut attempt_fn: F,
    mut progress_fn: impl FnMut(u32, u32, Duration, &E),
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut current_delay_for_next_sleep = policy.initial_delay;
    let mut attempt_num = 1;
    loop {
        match attempt_fn().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt_num == max_attempts {
                    return Err(RetryError::MaxRetriesExceeded {
                        last_error: e,
                        operation_description,
                        attempts_made: max_attempts,
                    });
                }
                progress_fn(attempt_num, max_attempts, current_delay_for_next_sleep, &e);
                sleep(current_delay_for_next_sleep).await;
                if policy.backoff_factor > 0 {
                    current_delay_for_next_sleep *= policy.backoff_factor;
                }
                attempt_num += 1;
            }
        }
    }
}
