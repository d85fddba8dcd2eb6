//! Fixed-interval polling with a deadline and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Polls a probe every `interval` until it yields a value, `max_duration`
/// elapses, or the cancellation token fires.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    max_duration: Duration,
    cancel: Option<CancellationToken>,
}

impl Poller {
    pub fn new(interval: Duration, max_duration: Duration) -> Self {
        Self {
            interval,
            max_duration,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Run the poll loop.
    ///
    /// The probe returns `Ok(None)` while pending. Transient probe errors are
    /// logged and treated as pending; any other error ends the poll.
    pub async fn poll<T, F, Fut>(&self, label: &str, mut probe: F) -> Result<PollOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let deadline = Instant::now() + self.max_duration;
        let mut attempts = 0u32;
        loop {
            if self.is_cancelled() {
                return Ok(PollOutcome::Cancelled);
            }

            attempts += 1;
            match probe().await {
                Ok(Some(value)) => return Ok(PollOutcome::Ready(value)),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    debug!(
                        operation = label,
                        attempts,
                        error = %e,
                        "poll check failed, continuing"
                    );
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + self.interval > deadline {
                debug!(operation = label, attempts, "poll deadline reached");
                return Ok(PollOutcome::TimedOut);
            }

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(PollOutcome::Cancelled),
                        _ = tokio::time::sleep(self.interval) => {}
                    }
                }
                None => tokio::time::sleep(self.interval).await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let poller = Poller::new(Duration::from_secs(2), Duration::from_secs(60));
        let outcome = poller
            .poll("receipt", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok((n == 3).then_some("0xabc"))
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Ready("0xabc"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let poller = Poller::new(Duration::from_secs(2), Duration::from_secs(10));
        let outcome: PollOutcome<()> = poller
            .poll("receipt", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
        // probes at t = 0, 2, 4, 6, 8, 10
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_polling() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let poller = Poller::new(Duration::from_secs(1), Duration::from_secs(30));
        let outcome = poller
            .poll("receipt", move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Error::Network("timed out".into())),
                    _ => Ok(Some(1u8)),
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Ready(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_ends_poll() {
        let poller = Poller::new(Duration::from_secs(1), Duration::from_secs(30));
        let result: Result<PollOutcome<()>> = poller
            .poll("receipt", move || async move { Err(Error::Io("disk".into())) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let poller = Poller::new(Duration::from_secs(1), Duration::from_secs(30))
            .with_cancellation(token);
        let outcome: PollOutcome<()> = poller
            .poll("receipt", move || async move { Ok(None) })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
