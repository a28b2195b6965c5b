//! Exponential backoff for transport operations.

use std::fmt;
use std::time;

use tracing::warn;

/// Backoff policy for retrying transient transport failures.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total attempts before the operation fails its caller.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Calculate the time until the next retry after the given zero-based
    /// attempt.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        if let Some(max_interval) = self.maximum_interval {
            std::cmp::min(candidate_interval, max_interval)
        } else {
            candidate_interval
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(60)),
            max_attempts: 5,
        }
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is exhausted,
/// sleeping between attempts. The final error is returned to the caller.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < policy.max_attempts => {
                let delay = policy.time_until_next_retry(attempt);
                warn!(
                    "{op_name} failed (attempt {}): {error}; retrying in {:?}",
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
