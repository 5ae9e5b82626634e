// =============================================================================
// Webhook Rate Limiter — per-user token bucket
// =============================================================================
//
// Keyed on user identity rather than IP: one noisy TradingView alert plan
// should never starve another tenant sharing the same ingress. Buckets are
// created lazily on first use and refilled lazily on each check rather than
// via a background ticker, mirroring the atomic-counter style the rest of
// this gateway uses for venue-side rate tracking.
// =============================================================================

use crate::types::UserId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: f64 = 30.0;
const DEFAULT_REFILL_PER_SEC: f64 = 0.5;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter keyed per user.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: DashMap<UserId, Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: DashMap::new(),
        }
    }

    /// Attempt to consume one token for `user_id`. Returns `false` if the
    /// bucket is exhausted.
    pub fn check(&self, user_id: UserId) -> bool {
        let entry = self
            .buckets
            .entry(user_id)
            .or_insert_with(|| Mutex::new(Bucket { tokens: self.capacity, last_refill: Instant::now() }));
        let mut bucket = entry.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .field("tracked_users", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn exhausts_after_capacity_requests() {
        let limiter = RateLimiter::new(3.0, 0.0);
        let user = Uuid::new_v4();
        assert!(limiter.check(user));
        assert!(limiter.check(user));
        assert!(limiter.check(user));
        assert!(!limiter.check(user));
    }

    #[test]
    fn separate_users_have_independent_buckets() {
        let limiter = RateLimiter::new(1.0, 0.0);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(1.0, 1000.0);
        let user = Uuid::new_v4();
        assert!(limiter.check(user));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.check(user));
    }
}
