//! Token-bucket admission control for outbound store calls.
//!
//! The bucket is refilled lazily on each acquisition attempt; there is no
//! background timer. When no token is available, [`RateLimiter::acquire`]
//! sleeps exactly until the next token is guaranteed and re-checks, so it
//! never starves and never polls on a fixed interval.
//!
//! # Example
//!
//! ```
//! use transcript_sync::RateLimiter;
//!
//! // 60 calls per minute
//! let limiter = RateLimiter::new(60, 1.0);
//! assert!(!limiter.try_acquire()); // bucket starts empty
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Token bucket state. Owned exclusively by [`RateLimiter`].
#[derive(Debug)]
struct RateLimitState {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimitState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is guaranteed.
    fn take_or_wait(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Token-bucket rate limiter gating dispatch against the store quota.
///
/// The bucket starts empty so requests are properly spaced from the first
/// call: across any window of `capacity / refill_per_sec` seconds from
/// construction, at most `capacity` acquisitions are admitted.
///
/// Lock discipline: the internal mutex is held only to mutate the bucket,
/// never across a sleep.
pub struct RateLimiter {
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    /// Create a limiter with the given bucket capacity and linear refill
    /// rate (tokens per second).
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                tokens: 0.0,
                capacity: f64::from(capacity.max(1)),
                refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until a token is available, then consume it.
    ///
    /// Cancel-safe: a token is only consumed at the instant the future
    /// completes, so dropping the future mid-wait leaves the bucket intact.
    pub async fn acquire(&self) {
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock();
                match state.take_or_wait(Instant::now()) {
                    Ok(()) => {
                        let waited = start.elapsed();
                        if !waited.is_zero() {
                            crate::metrics::record_rate_wait(waited);
                        }
                        return;
                    }
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for next token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a token if one is immediately available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.state.lock().take_or_wait(Instant::now()).is_ok()
    }

    /// Current token count (for observability).
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }
}
