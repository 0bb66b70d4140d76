//! Per-owner token bucket applied before submit validation.

use std::collections::HashMap;
use std::time::Instant;

/// Refills `per_minute` tokens per minute, continuously, capped at one
/// minute's worth of burst.
pub struct RateLimiter {
    per_minute: u32,
    buckets: HashMap<String, Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            buckets: HashMap::new(),
        }
    }

    /// Take one token for `owner`. Returns false when the bucket is dry.
    pub fn allow(&mut self, owner: &str) -> bool {
        self.allow_at(owner, Instant::now())
    }

    fn allow_at(&mut self, owner: &str, now: Instant) -> bool {
        let rate = f64::from(self.per_minute) / 60.0;
        let cap = f64::from(self.per_minute);

        let bucket = self.buckets.entry(owner.to_string()).or_insert(Bucket {
            tokens: cap,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(cap);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_up_to_limit_then_dry() {
        let mut limiter = RateLimiter::new(3);
        let now = Instant::now();
        assert!(limiter.allow_at("alice", now));
        assert!(limiter.allow_at("alice", now));
        assert!(limiter.allow_at("alice", now));
        assert!(!limiter.allow_at("alice", now));
    }

    #[test]
    fn owners_have_independent_buckets() {
        let mut limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.allow_at("alice", now));
        assert!(!limiter.allow_at("alice", now));
        assert!(limiter.allow_at("bob", now));
    }

    #[test]
    fn tokens_refill_over_time() {
        let mut limiter = RateLimiter::new(60); // one token per second
        let now = Instant::now();
        for _ in 0..60 {
            assert!(limiter.allow_at("alice", now));
        }
        assert!(!limiter.allow_at("alice", now));
        assert!(limiter.allow_at("alice", now + Duration::from_secs(2)));
    }
}
