//! Bounded retry with exponential backoff.
//!
//! A [`RetryPolicy`] runs an operation once and retries it up to
//! [`max_retries`](RetryPolicy::max_retries) more times. Retry `n` (1-based)
//! waits `first × factor^(n-1)`, clamped to `max`. The defaults reproduce a
//! `2^n` seconds schedule over 10 retries.
//!
//! Waiting between attempts observes a [`CancellationToken`]; an operation
//! that is already running is never interrupted.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use switchyard::dispatcher::retry::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::default();
//!
//! assert_eq!(backoff.next(0), Duration::from_secs(2));
//! assert_eq!(backoff.next(1), Duration::from_secs(4));
//! assert_eq!(backoff.next(9), Duration::from_secs(1024));
//! ```

use std::{fmt::Display, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

/// Growth of the delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// `first = 2s`, `factor = 2.0`, `max = 1h`.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(2),
            max: Duration::from_secs(3600),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    /// Delay before retry number `retry + 1`, i.e. `first × factor^retry`
    /// clamped to [`max`](BackoffPolicy::max).
    pub fn next(&self, retry: u32) -> Duration {
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retry budget for a failing operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Run the operation once, no retries.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `op` until it succeeds, the budget is spent, or `cancel` fires
    /// while waiting for the next attempt.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<F, Fut, T, E>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let attempts = attempt + 1;

            if attempt >= self.max_retries {
                return Err(RetryError::new(RetryErrorKind::Exhausted, attempts, err));
            }

            let delay = self.backoff.next(attempt);
            tracing::warn!(attempt = attempts, ?delay, error = %err, "Attempt failed, retrying");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::new(RetryErrorKind::Cancelled, attempts, err));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorKind {
    Exhausted,
    Cancelled,
}

/// Last error of an operation [`RetryPolicy::run`] gave up on.
#[derive(Debug)]
pub struct RetryError<E> {
    kind: RetryErrorKind,
    attempts: u32,
    last: E,
}

impl<E> RetryError<E> {
    fn new(kind: RetryErrorKind, attempts: u32, last: E) -> Self {
        Self {
            kind,
            attempts,
            last,
        }
    }

    pub fn kind(&self) -> RetryErrorKind {
        self.kind
    }

    /// Number of times the operation ran.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> &E {
        &self.last
    }

    pub fn into_last_error(self) -> E {
        self.last
    }
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RetryErrorKind::Exhausted => {
                write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
            }
            RetryErrorKind::Cancelled => {
                write!(f, "cancelled after {} attempts: {}", self.attempts, self.last)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn default_schedule_doubles_from_two_seconds() {
        let backoff = BackoffPolicy::default();
        let delays: Vec<u64> = (0..10).map(|n| backoff.next(n).as_secs()).collect();
        assert_eq!(delays, [2, 4, 8, 16, 32, 64, 128, 256, 512, 1024]);
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let backoff = BackoffPolicy {
            first: Duration::from_secs(1),
            max: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(backoff.next(3), Duration::from_secs(8));
        assert_eq!(backoff.next(4), Duration::from_secs(10));
        assert_eq!(backoff.next(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::default();
        let started = Instant::now();

        let result = policy
            .run(&CancellationToken::new(), |attempt| async move {
                if attempt < 2 { Err("boom") } else { Ok(attempt) }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let err = policy
            .run(&CancellationToken::new(), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("still failing")
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), RetryErrorKind::Exhausted);
        assert_eq!(err.attempts(), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert_eq!(*err.last_error(), "still failing");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let err = policy
            .run(&cancel, |_| async { Err::<(), _>("down") })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), RetryErrorKind::Cancelled);
        // Initial attempt, then the retry after 2s; cancelled while waiting 4s.
        assert_eq!(err.attempts(), 2);
    }
}
