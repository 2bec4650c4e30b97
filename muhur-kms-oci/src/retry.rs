//! Retry policy for OCI calls.

use crate::OciError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff on server errors.
///
/// Attempt `n` that fails with a 5xx is followed by a pause of
/// `base_delay * 2^(n-1)`. The pause is a `tokio` sleep, so dropping the
/// future abandons the remaining attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause after the first failed attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the last error from `call`.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, OciError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OciError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            tracing::trace!(operation, attempt, "calling oci");
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && err.is_retryable() => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "retrying oci call after backoff"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
