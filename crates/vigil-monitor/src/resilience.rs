//! Retry and circuit-breaker utilities.
//!
//! Both are stateful where it matters: a [`CircuitBreaker`] is constructed
//! once per protected operation class and reused across calls, so failure
//! counts survive between operations instead of resetting on every call.

use std::future::Future;
use std::sync::Mutex;

use tokio::time::{sleep, Duration, Instant};

use vigil_core::{Transient, VigilError};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following failed attempt `attempt`
    /// (zero-based): `base * multiplier^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(31) as i32);
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying transient failures with exponential backoff until it
/// succeeds, fails non-transiently, or the attempt budget is exhausted.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

/// Circuit breaker guarding one class of operations.
///
/// Opens after `failure_threshold` consecutive transient failures, rejects
/// immediately while open, admits a single trial call after
/// `reset_timeout`, and closes again when that trial succeeds.
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected calls fail with [`VigilError::Unavailable`] without invoking
    /// `op`. Non-transient errors mean the protected service responded, so
    /// they count as contact for the breaker while still propagating to the
    /// caller.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, VigilError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_transient() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            }
        }
    }

    fn admit(&self) -> Result<(), VigilError> {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::HalfOpen => Err(VigilError::Unavailable(format!(
                "{} circuit half-open, trial call in flight",
                self.name
            ))),
            Inner::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    tracing::info!(breaker = self.name, "Circuit half-open, admitting trial call");
                    *inner = Inner::HalfOpen;
                    Ok(())
                } else {
                    Err(VigilError::Unavailable(format!(
                        "{} circuit open, rejecting call",
                        self.name
                    )))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(*inner, Inner::HalfOpen) {
            tracing::info!(breaker = self.name, "Trial call succeeded, circuit closed");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(
                        breaker = self.name,
                        failures,
                        "Failure threshold reached, circuit opened"
                    );
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                tracing::warn!(breaker = self.name, "Trial call failed, circuit reopened");
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(100),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(5), Duration::from_millis(100));
        assert_eq!(policy.delay_for(31), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_uses_exactly_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), VigilError> = retry(&fast_policy(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VigilError::Infrastructure("storage offline".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VigilError::Infrastructure("flaky".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), VigilError> = retry(&fast_policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VigilError::Validation("bad input".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_rejects_then_recovers() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(VigilError::Infrastructure("down".to_string())) }
        };

        for _ in 0..3 {
            let _ = breaker.call(failing).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // While open, calls are rejected without touching the operation.
        let err = breaker.call(failing).await.unwrap_err();
        assert!(matches!(err, VigilError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // After the reset timeout one trial call is admitted; its success
        // closes the circuit.
        tokio::time::advance(Duration::from_secs(31)).await;
        let value = breaker
            .call(|| async { Ok::<_, VigilError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_the_circuit() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(10));

        let _ = breaker
            .call(|| async { Err::<(), _>(VigilError::Infrastructure("down".to_string())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = breaker
            .call(|| async { Err::<(), _>(VigilError::Infrastructure("still down".to_string())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // The fresh open period starts from the failed trial.
        let err = breaker
            .call(|| async { Ok::<_, VigilError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn domain_errors_do_not_trip_the_breaker() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_secs(10));

        for _ in 0..5 {
            let _ = breaker
                .call(|| async {
                    Err::<(), _>(VigilError::NotFound {
                        kind: "snapshot",
                        id: "missing".to_string(),
                    })
                })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(10));
        let fail = || async { Err::<(), _>(VigilError::Infrastructure("blip".to_string())) };

        let _ = breaker.call(fail).await;
        let _ = breaker.call(fail).await;
        let _ = breaker.call(|| async { Ok::<_, VigilError>(()) }).await;
        let _ = breaker.call(fail).await;
        let _ = breaker.call(fail).await;

        // Two failures, a success, two more failures: never three in a row.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
