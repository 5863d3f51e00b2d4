//! Circuit breaker guarding one upstream source.
//!
//! The breaker opens after a run of consecutive transient failures, refuses
//! calls for a cool-down, then admits a single trial call. A successful
//! trial closes it; a failed trial reopens it and restarts the cool-down.
//! Non-transient failures (a 404, a malformed body) never move the machine:
//! they prove the upstream is answering.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

use reproline_core::config::BreakerConfig;

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Meaningful only while `state` is `Open`.
    opened_at: Instant,
    trial_in_flight: bool,
}

enum Admission {
    Admitted { trial: bool },
    Rejected { remaining: Duration },
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: Instant::now(),
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.cooldown_ms),
        )
    }

    /// Current state without advancing the machine; only an admitted call
    /// moves `Open` to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker poisoned").state
    }

    /// Run `call` under admission control. While open, the call is refused
    /// with [`FetchError::BreakerOpen`] and no I/O happens. The lock is
    /// never held across the call itself.
    pub fn call<T>(&self, call: impl FnOnce() -> Result<T, FetchError>) -> Result<T, FetchError> {
        let trial = match self.admit() {
            Admission::Admitted { trial } => trial,
            Admission::Rejected { remaining } => {
                return Err(FetchError::BreakerOpen { remaining });
            }
        };
        let result = call();
        self.record(trial, &result);
        result
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            CircuitState::Closed => Admission::Admitted { trial: false },
            CircuitState::Open => {
                let since_open = inner.opened_at.elapsed();
                if since_open >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("breaker half-open, admitting trial call");
                    Admission::Admitted { trial: true }
                } else {
                    Admission::Rejected {
                        remaining: self.cooldown - since_open,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected {
                        remaining: Duration::ZERO,
                    }
                } else {
                    inner.trial_in_flight = true;
                    Admission::Admitted { trial: true }
                }
            }
        }
    }

    fn record<T>(&self, trial: bool, result: &Result<T, FetchError>) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match result {
            Ok(_) => {
                if trial {
                    info!("breaker trial succeeded, closing");
                }
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
            }
            Err(err) if trial => {
                warn!("breaker trial failed ({err}), reopening");
                inner.state = CircuitState::Open;
                inner.opened_at = Instant::now();
                inner.trial_in_flight = false;
            }
            Err(err) if err.is_retryable() => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        "breaker opened after {} consecutive transient failures",
                        inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Instant::now();
                }
            }
            // Non-transient failures leave the machine untouched.
            Err(_) => {}
        }
    }
}
