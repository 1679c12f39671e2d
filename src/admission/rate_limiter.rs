//! Per-caller token bucket rate limiting

use crate::config::RateLimitSettings;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by caller identity (the peer address)
///
/// Each bucket holds up to `burst` tokens and refills continuously at
/// `max_requests / window`. A request spends one token; an empty bucket
/// rejects with the time until the next token.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    capacity: f64,
    refill_per_sec: f64,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32, burst: u32) -> Self {
        let window = window.max(Duration::from_millis(1));
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: f64::from(burst.max(1)),
            refill_per_sec: f64::from(max_requests.max(1)) / window.as_secs_f64(),
            idle_ttl: window * 2,
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.window_secs),
            settings.max_requests,
            settings.burst,
        )
    }

    /// Spend one token for `identity`, or return how long until one is available
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(identity.to_string()).or_insert(TokenBucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
        debug!(identity, wait_ms = (wait * 1000.0) as u64, "Rate limit exceeded");
        Err(Duration::from_secs_f64(wait))
    }

    /// Drop buckets untouched for longer than two windows
    pub fn prune(&self) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_refill.elapsed() <= self.idle_ttl);
        before - buckets.len()
    }

    pub fn tracked_callers(&self) -> usize {
        self.buckets.lock().len()
    }
}
