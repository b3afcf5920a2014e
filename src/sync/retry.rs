//! Retry Policy - bounded retries for remote operations
//!
//! Wraps a remote call and retries it while the error is retryable:
//! - Fixed attempt budget (default: 3 attempts)
//! - Linear backoff (attempt × base delay) by default
//! - Optional capped exponential backoff with jitter
//! - Non-retryable errors fail immediately, without consuming the budget

use super::error::SyncError;
use super::models::SyncConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 5000;
const JITTER_FRACTION: f64 = 0.1;

// ============================================================================
// Data Types
// ============================================================================

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// attempt × base delay
    Linear,
    /// base × 2^(attempt - 1), capped at `max_delay_ms`, plus up to 10% jitter
    Exponential { max_delay_ms: u64, jitter: bool },
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, SyncError>,
    /// Attempts actually made (always >= 1)
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        )
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
        )
        .with_backoff(config.backoff)
    }
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one attempt
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: BackoffStrategy::Linear,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after `failed_attempts` attempts have failed
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(failed_attempts),
            BackoffStrategy::Exponential { max_delay_ms, jitter } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                let max_delay = Duration::from_millis(max_delay_ms);
                let delay = self
                    .base_delay
                    .saturating_mul(1u32 << exponent)
                    .min(max_delay);

                if jitter && !delay.is_zero() {
                    let jitter_ms = (delay.as_millis() as f64 * JITTER_FRACTION) as u64;
                    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                } else {
                    delay
                }
            }
        }
    }

    /// Run `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{} succeeded on attempt {}/{}", label, attempt, self.max_attempts);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                if matches!(err, SyncError::UnknownError(_)) {
                    log::error!("{} failed with unexpected error: {}", label, err);
                } else {
                    log::warn!("{} failed with non-retryable error: {}", label, err);
                }
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            if attempt >= self.max_attempts {
                log::warn!("{} failed after {} attempts: {}", label, attempt, err);
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            log::info!(
                "{} attempt {}/{} failed ({}), retrying in {:?}",
                label, attempt, self.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(15));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1)).with_backoff(
            BackoffStrategy::Exponential {
                max_delay_ms: 30_000,
                jitter: false,
            },
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_jitter_bounded() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1)).with_backoff(
            BackoffStrategy::Exponential {
                max_delay_ms: 30_000,
                jitter: true,
            },
        );
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2200));
        }
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let outcome = fast_policy()
            .execute("op", |_| async { Ok::<_, SyncError>(7) })
            .await;
        assert_eq!(outcome.result, Ok(7));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = fast_policy()
            .execute("op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(SyncError::ServerUnavailable)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result, Ok(3));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = fast_policy()
            .execute("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::NetworkUnavailable) }
            })
            .await;

        assert_eq!(outcome.result, Err(SyncError::NetworkUnavailable));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_single_attempt() {
        for err in [
            SyncError::validation("year", "too old"),
            SyncError::PermissionDenied("remote".into()),
            SyncError::AuthenticationExpired,
            SyncError::UnknownError("boom".into()),
        ] {
            let calls = AtomicU32::new(0);
            let expected = err.clone();
            let outcome: RetryOutcome<()> = fast_policy()
                .execute("op", |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let err = err.clone();
                    async move { Err(err) }
                })
                .await;

            assert_eq!(outcome.result, Err(expected));
            assert_eq!(outcome.attempts, 1);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_delays_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        let outcome: RetryOutcome<()> = policy
            .execute("op", |_| async { Err(SyncError::RateLimitExceeded) })
            .await;

        assert_eq!(outcome.attempts, 3);
        // 5s after the first failure, 10s after the second, none after the last
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(16));
    }
}
