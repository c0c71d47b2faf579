//! Retry policy for LLM calls.
//!
//! The policy decides, from the [`LlmError`] class alone, whether a failed call
//! is attempted again. Rate limits back off exponentially:
//!
//!   delay_k = min(base_delay * multiplier^k, max_delay)
//!
//! with the provider's `retry_after` hint taking precedence when it is longer.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LlmError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Retry [`LlmError::Transient`] as well as rate limits.
    pub retry_transient: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            retry_transient: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, err: &LlmError) -> bool {
        match err {
            LlmError::RateLimited { .. } => true,
            LlmError::Transient(_) => self.retry_transient,
            LlmError::Permanent(_) => false,
        }
    }

    /// Backoff before attempt `attempt + 1` (0-indexed `attempt`).
    pub fn delay_for(&self, attempt: usize, err: &LlmError) -> Duration {
        let exp = self.multiplier.powi(attempt.min(30) as i32);
        let computed = self.base_delay.mul_f64(exp).min(self.max_delay);
        match err {
            LlmError::RateLimited {
                retry_after: Some(hint),
            } => computed.max(*hint),
            _ => computed,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts || !self.should_retry(&err) {
                        if attempt >= attempts && self.should_retry(&err) {
                            warn!(label, attempts, error = %err, "Retry ceiling reached");
                        }
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt - 1, &err);
                    debug!(label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying LLM call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            retry_transient: false,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        let err = LlmError::RateLimited { retry_after: None };
        assert_eq!(policy.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3, &err), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        let err = LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(policy.delay_for(0, &err), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rate_limit_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let result = fast_policy(5)
            .run("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(LlmError::RateLimited { retry_after: None })
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Permanent("bad".into()))
            })
            .await;
        assert!(matches!(result, Err(LlmError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_only_retried_when_enabled() {
        let calls = AtomicUsize::new(0);
        let _ = fast_policy(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Transient("reset".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            retry_transient: true,
            ..fast_policy(3)
        };
        let _ = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LlmError::Transient("reset".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: Result<(), _> = fast_policy(2)
            .run("test", || async { Err(LlmError::RateLimited { retry_after: None }) })
            .await;
        assert!(matches!(result, Err(LlmError::RateLimited { .. })));
    }
}
