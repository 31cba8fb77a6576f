//! Circuit breaker (C3): closed/open/half-open state guarding remote writes.
//!
//! All transitions occur under a single `parking_lot::Mutex` so calls
//! serialize through the breaker, per spec §4.3 and §5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_state_change: Instant,
    /// True while a half-open probe call is executing. Guards the spec §8
    /// "exactly one call executes in HalfOpen" law against concurrent
    /// callers racing in after the cooldown elapses.
    half_open_probe_in_flight: bool,
}

/// Configuration for breaker thresholds. Defaults match spec §4.3.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_success_threshold: 1,
        }
    }
}

/// Fault-containment wrapper around remote writes.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    /// Total number of times this breaker has transitioned into `Open`,
    /// for the `powerlogd_breaker_trips_total` counter.
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_state_change: Instant::now(),
                half_open_probe_in_flight: false,
            }),
            trips: AtomicU64::new(0),
        }
    }

    /// Total number of `Closed`/`HalfOpen` -> `Open` transitions so far.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Whether a call may currently proceed, and transition to `HalfOpen`
    /// if the cooldown has elapsed while `Open`. Returns `Err(BreakerError::Open)`
    /// when the call must be refused without invoking the wrapped function.
    fn admit(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(()),
            State::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    Err(BreakerError::Open)
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
            State::Open => {
                if inner.last_state_change.elapsed() > self.config.cooldown {
                    inner.state = State::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_probe_in_flight = true;
                    inner.last_state_change = Instant::now();
                    Ok(())
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.last_state_change = Instant::now();
                }
                inner.half_open_probe_in_flight = false;
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open;
                    inner.last_state_change = Instant::now();
                    self.trips.fetch_add(1, Ordering::Relaxed);
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.last_state_change = Instant::now();
                inner.half_open_probe_in_flight = false;
                self.trips.fetch_add(1, Ordering::Relaxed);
            }
            State::Open => {}
        }
    }

    /// Execute `f` through the breaker. `f`'s `Result::Err` is treated as a
    /// breaker failure regardless of its concrete error type.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().map_err(BreakerOutcome::Open)?;
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerOutcome::Inner(e))
            }
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, State::Open)
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, State::Closed)
    }

    #[cfg(test)]
    fn is_half_open(&self) -> bool {
        matches!(self.inner.lock().state, State::HalfOpen)
    }
}

/// Outcome of a breaker-guarded call: either the breaker refused the call,
/// or the wrapped function ran and failed with `E`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerOutcome<E> {
    Open(BreakerError),
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok() -> Result<(), &'static str> {
        Ok(())
    }
    async fn fail() -> Result<(), &'static str> {
        Err("boom")
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_and_refuses_without_invoking() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            half_open_success_threshold: 1,
        });

        for _ in 0..3 {
            let result = breaker.call(fail).await;
            assert!(matches!(result, Err(BreakerOutcome::Inner(_))));
        }
        assert!(breaker.is_open());
        assert_eq!(breaker.trip_count(), 1);

        // The breaker must refuse without invoking the wrapped function.
        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .call(|| async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                ok().await
            })
            .await;
        assert!(matches!(result, Err(BreakerOutcome::Open(BreakerError::Open))));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn half_open_after_cooldown_executes_exactly_one_call() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(20),
            half_open_success_threshold: 1,
        });

        let _ = breaker.call(fail).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = breaker.call(ok).await;
        assert!(result.is_ok());
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn closes_after_success_threshold_in_half_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            half_open_success_threshold: 2,
        });

        let _ = breaker.call(fail).await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        let _ = breaker.call(ok).await;
        assert!(breaker.is_half_open());

        let _ = breaker.call(ok).await;
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            half_open_success_threshold: 2,
        });

        let _ = breaker.call(fail).await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        let _ = breaker.call(fail).await;
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn only_one_concurrent_call_executes_in_half_open() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            half_open_success_threshold: 1,
        }));

        let _ = breaker.call(fail).await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        let gate = std::sync::Arc::new(tokio::sync::Notify::new());
        let first = {
            let breaker = breaker.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async {
                        gate.notified().await;
                        ok().await
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        // A second caller arriving while the first probe is still in flight
        // must be refused, not admitted as a second concurrent probe.
        let second = breaker.call(ok).await;
        assert!(matches!(second, Err(BreakerOutcome::Open(BreakerError::Open))));

        gate.notify_one();
        let first_result = first.await.unwrap();
        assert!(first_result.is_ok());
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures_in_closed_state() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            half_open_success_threshold: 1,
        });

        let _ = breaker.call(fail).await;
        let _ = breaker.call(fail).await;
        let _ = breaker.call(ok).await;
        let _ = breaker.call(fail).await;
        let _ = breaker.call(fail).await;
        assert!(breaker.is_closed(), "two failures after a reset should not open the breaker");
    }
}
