//! Fixed-delay retry policy shared by the connect, enqueue and dequeue paths.
//!
//! Only transient failures (see [`Error::is_transient`]) are retried. The
//! first non-transient failure, or the last transient one, ends the loop.

use crate::error::Error;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Never less than 1.
    pub max_retries: u32,
    /// Pause between consecutive attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Attempts actually made.
    pub attempts: u32,
    pub last_error: Error,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        self.retry_delay * (self.attempts() - 1)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> std::result::Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = max,
                        delay_ms = self.retry_delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    metrics::retry_attempts()
                        .add(1, &[KeyValue::new("operation", operation)]);
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_last_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let value = policy
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::Connection("down".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Connection("down".to_string())) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err.last_error, Error::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Validation("bad".to_string())) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_budget_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::from_secs(5));
        assert_eq!(policy.max_total_delay(), Duration::ZERO);
    }
}
