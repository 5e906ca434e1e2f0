//! Admission control for alert dispatch.
//!
//! A token bucket with capacity one that refills continuously at one token
//! per interval. [`RateLimiter::try_admit`] never blocks: it either consumes
//! the token and admits, or denies immediately.
//!
//! Production uses [`NOTIFY_INTERVAL`] (one dispatch per 20 minutes); tests
//! pass a shorter interval or drive the clock through
//! [`RateLimiter::try_admit_at`].

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::constants::NOTIFY_INTERVAL;

/// Bucket capacity (maximum burst).
const CAPACITY: f64 = 1.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Global single-token rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(NOTIFY_INTERVAL)
    }
}

impl RateLimiter {
    /// Create a full bucket that refills one token per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn starting_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            bucket: Mutex::new(Bucket {
                tokens: CAPACITY,
                last_refill: now,
            }),
        }
    }

    /// Refill interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Admit now if a token is available.
    pub fn try_admit(&self) -> bool {
        self.try_admit_at(Instant::now())
    }

    /// Admit at `now` if a token is available, consuming it.
    ///
    /// A `now` earlier than the last refill adds nothing.
    pub fn try_admit_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if !elapsed.is_zero() {
            let refill = if self.interval.is_zero() {
                CAPACITY
            } else {
                elapsed.as_secs_f64() / self.interval.as_secs_f64()
            };
            bucket.tokens = (bucket.tokens + refill).min(CAPACITY);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            log::debug!("[RateLimit] Denied, {:.3} token(s) available", bucket.tokens);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(1200);

    #[test]
    fn test_fresh_limiter_admits_once() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(INTERVAL, start);
        assert!(limiter.try_admit_at(start));
        assert!(!limiter.try_admit_at(start));
    }

    #[test]
    fn test_admits_again_after_full_interval() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(INTERVAL, start);
        assert!(limiter.try_admit_at(start));
        assert!(!limiter.try_admit_at(start + INTERVAL / 2));
        assert!(limiter.try_admit_at(start + INTERVAL));
    }

    #[test]
    fn test_refill_is_continuous_across_denials() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(INTERVAL, start);
        assert!(limiter.try_admit_at(start));

        // Denied checks along the way must not reset accumulated refill
        for quarter in 1..4 {
            assert!(!limiter.try_admit_at(start + INTERVAL / 4 * quarter));
        }
        assert!(limiter.try_admit_at(start + INTERVAL));
    }

    #[test]
    fn test_idle_time_does_not_bank_extra_admissions() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(INTERVAL, start);
        let later = start + INTERVAL * 10;
        assert!(limiter.try_admit_at(later));
        assert!(!limiter.try_admit_at(later));
    }

    #[test]
    fn test_default_uses_twenty_minutes() {
        assert_eq!(RateLimiter::default().interval(), Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_real_clock_short_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit());
        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.try_admit());
    }
}
