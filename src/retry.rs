//! Bounded retry for upstream collaborators.
//!
//! Only errors for which [`Error::is_retryable`] holds are retried; every
//! other error is returned on first sight.

use crate::config::{PaymentConfig, PipelineConfig};
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Largest backoff exponent; keeps the shift well inside `u32`.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubled after each further failure.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Policy with the given attempts and base backoff. Zero attempts is
    /// treated as one.
    #[must_use]
    pub const fn new(attempts: u32, base_backoff: Duration) -> Self {
        Self {
            attempts,
            base_backoff,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Policy for chain RPC calls.
    #[must_use]
    pub fn for_chain(config: &PaymentConfig) -> Self {
        Self::new(
            config.upstream_retry_attempts,
            Duration::from_millis(config.upstream_backoff_ms),
        )
    }

    /// Policy for pipeline calls.
    #[must_use]
    pub fn for_pipeline(config: &PipelineConfig) -> Self {
        Self::new(
            config.upstream_retry_attempts,
            Duration::from_millis(config.upstream_backoff_ms),
        )
    }

    /// Delay after the `failed`-th failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_backoff.saturating_mul(1 << shift)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut failed = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && failed + 1 < attempts => {
                    failed += 1;
                    let delay = self.backoff(failed);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, failed, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_upstream_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        let value = policy
            .run("probe", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::UpstreamUnavailable("down".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("third attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(50));
        let result: Result<()> = policy
            .run("probe", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::UpstreamUnavailable("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_returned_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::new(5, Duration::from_millis(50))
            .run("probe", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("bad".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
