//! Token-bucket rate limiter shared by every worker of one run.
//!
//! Tokens refill continuously at the configured rate up to the burst
//! capacity. Workers block on [`RateLimiter::acquire`]; the wait is sliced
//! so a cancelled run stops queuing promptly instead of sleeping out its
//! full deficit.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use reproline_core::context::CancelToken;

use crate::error::FetchError;

/// Upper bound on a single wait, so cancellation is observed even when the
/// next token is far away.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

pub struct RateLimiter {
    state: Mutex<Bucket>,
    available: Condvar,
    /// Tokens per second; must be positive.
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    /// A bucket starting full. `rate_per_sec` must be positive and `burst`
    /// at least 1 (both enforced by configuration validation upstream).
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = f64::from(burst);
        Self {
            state: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
            available: Condvar::new(),
            rate: rate_per_sec,
            capacity,
        }
    }

    /// Block until a token is available, consuming it. Returns
    /// [`FetchError::Cancelled`] as soon as the token trips instead.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<(), FetchError> {
        let mut bucket = self.state.lock().expect("rate limiter poisoned");
        loop {
            refill(&mut bucket, self.rate, self.capacity);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate)
                .clamp(Duration::from_millis(1), MAX_WAIT_SLICE);
            let (guard, _) = self
                .available
                .wait_timeout(bucket, wait)
                .expect("rate limiter poisoned");
            bucket = guard;
        }
    }

    /// Consume a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.state.lock().expect("rate limiter poisoned");
        refill(&mut bucket, self.rate, self.capacity);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn refill(bucket: &mut Bucket, rate: f64, capacity: f64) {
    let now = Instant::now();
    let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
    bucket.refilled_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn burst_grants_capacity_immediately() {
        let limiter = RateLimiter::new(1.0, 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(100.0, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new(1000.0, 2);
        thread::sleep(Duration::from_millis(50));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_token() {
        let limiter = RateLimiter::new(50.0, 1);
        let cancel = CancelToken::new();
        limiter.acquire(&cancel).unwrap();

        let started = Instant::now();
        limiter.acquire(&cancel).unwrap();
        // 50 rps means the second token lands ~20ms after the first.
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn cancelled_acquire_stops_waiting() {
        let limiter = RateLimiter::new(0.1, 1);
        let cancel = CancelToken::new();
        limiter.acquire(&cancel).unwrap();

        cancel.cancel();
        match limiter.acquire(&cancel) {
            Err(FetchError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
