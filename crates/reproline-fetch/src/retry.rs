//! Exponential backoff with jitter, honoring server throttle hints.

use std::thread;
use std::time::Duration;

use indicatif::ProgressBar;
use log::{debug, warn};
use rand::Rng;

use reproline_core::config::RetryConfig;
use reproline_core::context::CancelToken;

use crate::error::FetchError;

/// Backoff sleeps are taken in slices so cancellation interrupts a wait.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic exponential term for attempt `n` (1-based): the base
    /// delay grown by `multiplier^(n-1)`, capped at the configured maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let grown =
            self.base_delay.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before re-attempting after attempt `n` failed. A server
    /// throttle hint wins outright, uncapped; otherwise uniform jitter in
    /// `[0, backoff)` is added on top of the exponential term.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let backoff = self.backoff(attempt);
        backoff + jitter(backoff)
    }
}

fn jitter(upper: Duration) -> Duration {
    let micros = upper.as_micros() as u64;
    if micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..micros))
}

/// Run `attempt` until it succeeds, exhausts the policy, or fails in a way
/// retrying cannot fix. Sleeps the policy's delay between attempts, and
/// reports the wait on the request's progress bar.
pub fn run_with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    pb: &ProgressBar,
    cancel: &CancelToken,
    mut attempt: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut tries = 0u32;
    loop {
        tries += 1;
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                debug!("{label}: not retryable: {err}");
                return Err(err);
            }
            Err(err) if tries >= policy.max_attempts() => {
                warn!("{label}: exhausted {tries} attempt(s): {err}");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay(tries, err.retry_after());
                pb.set_message(format!(
                    "retry {}/{} in {:.1}s",
                    tries + 1,
                    policy.max_attempts(),
                    delay.as_secs_f64()
                ));
                debug!(
                    "{label}: attempt {tries}/{} failed ({err}), retrying in {:.1}s",
                    policy.max_attempts(),
                    delay.as_secs_f64()
                );
                if !sleep_cancellable(delay, cancel) {
                    return Err(FetchError::Cancelled);
                }
            }
        }
    }
}

/// Returns false when the wait was interrupted by cancellation.
fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !cancel.is_cancelled()
}
