//! Circuit breaker around the distributed tier.
//!
//! A small three-state machine: `Closed` counts consecutive failures, `Open`
//! fails fast until a cool-down deadline, `HalfOpen` lets a single probe call
//! through and transitions on its outcome.

use crate::error::CacheError;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: u32 = 5;
const COOL_DOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Breaker guarding calls to the distributed store.
pub struct CircuitBreaker {
    state: Mutex<State>,
    failure_threshold: u32,
    cool_down: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOL_DOWN)
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            failure_threshold,
            cool_down,
        }
    }

    /// Gate a call. `Err(BreakerOpen)` while the cool-down is running; once
    /// it elapses the breaker goes half-open and admits the next call.
    pub fn allow(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    tracing::debug!("circuit breaker half-open, admitting probe call");
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(CacheError::BreakerOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, State::Closed { failures: 0 }) {
            tracing::debug!("circuit breaker closed");
        }
        *state = State::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(failures, "circuit breaker open");
                    State::Open {
                        until: Instant::now() + self.cool_down,
                    }
                } else {
                    State::Closed { failures }
                }
            }
            // A failed half-open probe restarts the cool-down.
            State::HalfOpen => State::Open {
                until: Instant::now() + self.cool_down,
            },
            open @ State::Open { .. } => open,
        };
    }

    /// Whether the breaker currently fails fast.
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open { until } if Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(5));
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.allow().is_ok());
        }
        breaker.record_failure();
        assert!(matches!(breaker.allow(), Err(CacheError::BreakerOpen)));
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(5));
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.allow().is_ok(), "count should have restarted");
    }

    #[tokio::test]
    async fn cool_down_admits_a_probe_then_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure();
        assert!(breaker.allow().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().is_ok(), "half-open probe admitted");

        breaker.record_failure();
        assert!(breaker.allow().is_err(), "failed probe reopens");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().is_ok());
        breaker.record_success();
        assert!(breaker.allow().is_ok());
        assert!(!breaker.is_open());
    }
}
