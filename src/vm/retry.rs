//! Bounded exponential backoff for remote operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// The last error of an operation that never succeeded.
#[derive(Debug)]
pub struct RetryExhausted {
    pub error: ProviderError,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy without sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_transient() || attempt >= max => {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let delay = self.next_backoff(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.next_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.next_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.next_backoff(3), Duration::from_millis(400));
        assert_eq!(policy.next_backoff(4), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Permanent("quota".into()))
            })
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Transient("down".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
