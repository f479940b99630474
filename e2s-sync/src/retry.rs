//! Bounded retries with exponential backoff and jitter.
//!
//! Retryable failures (rate limit, server errors, transport) wait
//! `min(max_delay, base * 2^(attempt-1))`, or the server's `Retry-After`
//! (also capped at `max_delay`) when given, stretched by a random
//! `[0, jitter]` fraction. Other failures return immediately.

use std::time::Duration;

use e2s_core::RetryPolicy;
use rand::Rng;

use crate::error::ApiError;

/// How the retrier waits. Swapped out in tests.
pub trait Sleeper {
    fn sleep(&mut self, delay: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Records requested delays without waiting.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    pub delays: Vec<Duration>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, delay: Duration) {
        self.delays.push(delay);
    }
}

/// Result of a retried call and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ApiError>,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct Retrier<S = ThreadSleeper> {
    policy: RetryPolicy,
    sleeper: S,
}

impl Retrier<ThreadSleeper> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, ThreadSleeper)
    }
}

impl<S: Sleeper> Retrier<S> {
    pub fn with_sleeper(policy: RetryPolicy, sleeper: S) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Delay before the retry that follows failed attempt `attempt`. A
    /// server-requested wait is capped at `max_delay_ms` like the backoff.
    pub fn delay_for(&self, attempt: u32, err: &ApiError) -> Duration {
        let cap = Duration::from_millis(self.policy.max_delay_ms);
        let base = err
            .retry_after()
            .map(|wait| wait.min(cap))
            .unwrap_or_else(|| self.policy.backoff(attempt));
        add_jitter(base, self.policy.jitter)
    }

    /// Runs `op` until it succeeds, fails permanently, or `max_attempts` is
    /// reached.
    pub fn call<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut() -> Result<T, ApiError>,
    ) -> Attempted<T> {
        let max = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(err) if err.is_retryable() && attempt < max => {
                    let delay = self.delay_for(attempt, &err);
                    tracing::warn!(
                        "{what} failed (attempt {attempt}/{max}): {err}; retrying in {:.2}s",
                        delay.as_secs_f64()
                    );
                    self.sleeper.sleep(delay);
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!("{what} failed after {attempt} attempts: {err}");
                    } else {
                        tracing::error!("{what} failed: {err}");
                    }
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

fn add_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..=jitter);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
            min_interval_ms: 0,
        }
    }

    fn transient() -> ApiError {
        ApiError::from_status(503, "unavailable", None)
    }

    #[test]
    fn succeeds_after_transient_failures_with_doubling_delays() {
        let mut retrier = Retrier::with_sleeper(policy(5), RecordingSleeper::default());
        let mut calls = 0;
        let out = retrier.call("list", || {
            calls += 1;
            if calls < 4 {
                Err(transient())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.result.unwrap(), 4);
        assert_eq!(out.attempts, 4);
        assert_eq!(
            retrier.sleeper().delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut retrier = Retrier::with_sleeper(policy(3), RecordingSleeper::default());
        let out: Attempted<()> = retrier.call("patch", || Err(transient()));
        assert!(matches!(out.result, Err(ApiError::Transient { .. })));
        assert_eq!(out.attempts, 3);
        assert_eq!(retrier.sleeper().delays.len(), 2);
    }

    #[test]
    fn persistent_errors_are_not_retried() {
        let mut retrier = Retrier::with_sleeper(policy(8), RecordingSleeper::default());
        let out: Attempted<()> =
            retrier.call("create", || Err(ApiError::from_status(422, "bad", None)));
        assert_eq!(out.attempts, 1);
        assert!(retrier.sleeper().delays.is_empty());
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let mut retrier = Retrier::with_sleeper(policy(2), RecordingSleeper::default());
        let mut first = true;
        let out = retrier.call("list", || {
            if std::mem::take(&mut first) {
                Err(ApiError::from_status(429, "slow", Some("1")))
            } else {
                Ok(())
            }
        });
        assert!(out.result.is_ok());
        assert_eq!(retrier.sleeper().delays, vec![Duration::from_secs(1)]);
    }

    #[test]
    fn huge_retry_after_is_capped_at_max_delay() {
        let jittered = RetryPolicy {
            jitter: 0.25,
            ..policy(3)
        };
        let mut retrier = Retrier::with_sleeper(jittered, RecordingSleeper::default());
        let out: Attempted<()> = retrier.call("list", || {
            Err(ApiError::from_status(429, "slow", Some("18446744073709551615")))
        });
        assert_eq!(out.attempts, 3);
        let delays = &retrier.sleeper().delays;
        assert_eq!(delays.len(), 2);
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(1_000) && *d <= Duration::from_millis(1_250)));

        let mut retrier = Retrier::with_sleeper(policy(2), RecordingSleeper::default());
        let _: Attempted<()> =
            retrier.call("list", || Err(ApiError::from_status(503, "busy", Some("1e30"))));
        assert_eq!(retrier.sleeper().delays, vec![Duration::from_millis(100)]);
    }

    #[test]
    fn backoff_is_capped() {
        let retrier = Retrier::with_sleeper(policy(20), RecordingSleeper::default());
        assert_eq!(
            retrier.delay_for(15, &transient()),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn jitter_stays_within_fraction() {
        for _ in 0..50 {
            let d = add_jitter(Duration::from_millis(1_000), 0.25);
            assert!(d >= Duration::from_millis(1_000) && d <= Duration::from_millis(1_250));
        }
    }
}
