use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::PipelineError;

/// Bounded exponential backoff policy wrapped around sends and dispatch.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt fails.
    max_retries: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            max_retries,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

/// Runs `op`, retrying retryable failures with exponential backoff until the
/// policy is exhausted. Non-retryable failures are returned immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries() => {
                let delay = policy.time_until_next_retry(attempt);
                warn!(
                    error = %err,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, backing off before retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
