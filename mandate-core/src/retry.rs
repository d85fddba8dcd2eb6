//! Backoff and retry for network round-trips.
//!
//! Only errors the policy's classifier marks as transient are retried.
//! Everything else, and the last transient failure once retries run out,
//! is returned to the caller unchanged.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Decides whether an error is worth retrying.
pub type TransienceClassifier = fn(&Error) -> bool;

/// Retry behaviour for one call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Double the delay after each retry instead of waiting `base_delay`.
    pub exponential: bool,
    pub classifier: TransienceClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            exponential: true,
            classifier: Error::is_transient,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = if self.exponential {
            let factor = 2u32.saturating_pow(retry.min(16));
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay
        };
        delay.min(self.max_delay)
    }
}

/// Runs async operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// retries are exhausted. `op` receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let transient = (self.policy.classifier)(&e);
                    if !transient || attempt >= self.policy.max_retries {
                        if transient {
                            warn!(
                                operation = label,
                                attempts = attempt + 1,
                                error = %e,
                                "retries exhausted"
                            );
                        }
                        return Err(e);
                    }
                    let backoff = self.policy.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            exponential: true,
            classifier: Error::is_transient,
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            exponential: true,
            classifier: Error::is_transient,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_delay_is_constant() {
        let policy = RetryPolicy {
            exponential: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), policy.delay_for(5));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = RetryExecutor::new(fast_policy(3))
            .run("probe", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("connection reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = RetryExecutor::new(fast_policy(5))
            .run("probe", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Reverted {
                    tx_hash: None,
                    reason: "nope".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(Error::Reverted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = RetryExecutor::new(fast_policy(2))
            .run("probe", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(Error::HttpStatus {
                        status: 503,
                        message: format!("attempt {attempt}"),
                    })
                }
            })
            .await;
        match result {
            Err(Error::HttpStatus { message, .. }) => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let policy = RetryPolicy {
            classifier: |_| false,
            ..fast_policy(3)
        };
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let _: Result<()> = RetryExecutor::new(policy)
            .run("probe", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("timeout".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
