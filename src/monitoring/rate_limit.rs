//! Token-bucket rate limiting per unit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Limits for one unit: `requests` tokens refill over `window_secs`,
/// and the bucket never holds more than `burst` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_secs: u64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests: 120, window_secs: 60, burst: 20 }
    }
}

impl RateLimitConfig {
    fn capacity(&self) -> f64 {
        f64::from(self.burst.max(1))
    }

    fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests) / self.window_secs.max(1) as f64
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(config: &RateLimitConfig) -> Self {
        Self { tokens: config.capacity(), last_refill: Instant::now() }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec()).min(config.capacity());
        self.last_refill = Instant::now();
    }
}

/// Per-unit token buckets. Each check refills and takes under one lock.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    default: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with a default config and per-unit overrides.
    pub fn new(default: RateLimitConfig, overrides: HashMap<String, RateLimitConfig>) -> Self {
        Self { enabled: true, default, overrides, buckets: Mutex::new(HashMap::new()) }
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::new(RateLimitConfig::default(), HashMap::new()) }
    }

    /// Limits in force for a unit.
    pub fn config_for(&self, unit_id: &str) -> RateLimitConfig {
        self.overrides.get(unit_id).copied().unwrap_or(self.default)
    }

    /// Take one token if available.
    pub fn check(&self, unit_id: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let config = self.config_for(unit_id);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(unit_id.to_string()).or_insert_with(|| Bucket::full(&config));
        bucket.refill(&config);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token or fail with `RateLimited`.
    pub fn acquire(&self, unit_id: &str) -> BridgeResult<()> {
        if self.check(unit_id) {
            Ok(())
        } else {
            tracing::warn!(unit = %unit_id, "Rate limit exceeded");
            Err(BridgeError::RateLimited(unit_id.to_string()))
        }
    }

    /// Tokens currently available to a unit.
    pub fn remaining(&self, unit_id: &str) -> u32 {
        let config = self.config_for(unit_id);
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(unit_id) {
            Some(bucket) => {
                bucket.refill(&config);
                bucket.tokens.floor() as u32
            }
            None => config.capacity() as u32,
        }
    }

    /// Time until the next token becomes available.
    pub fn retry_after(&self, unit_id: &str) -> Duration {
        let config = self.config_for(unit_id);
        let buckets = self.buckets.lock();
        match buckets.get(unit_id) {
            Some(bucket) if bucket.tokens < 1.0 && config.refill_per_sec() > 0.0 => {
                Duration::from_secs_f64((1.0 - bucket.tokens) / config.refill_per_sec())
            }
            _ => Duration::ZERO,
        }
    }

    /// Drop a unit's bucket, e.g. on uninstall.
    pub fn reset(&self, unit_id: &str) {
        self.buckets.lock().remove(unit_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new(
            RateLimitConfig { requests: 1, window_secs: 3600, burst: 3 },
            HashMap::new(),
        );

        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(matches!(limiter.acquire("a"), Err(BridgeError::RateLimited(_))));
        assert!(limiter.retry_after("a") > Duration::ZERO);

        // Buckets are per unit.
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new(
            RateLimitConfig { requests: 1000, window_secs: 1, burst: 1 },
            HashMap::new(),
        );
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.check("a"));
    }

    #[test]
    fn test_overrides_and_reset() {
        let mut overrides = HashMap::new();
        overrides.insert("noisy".to_string(), RateLimitConfig { requests: 1, window_secs: 60, burst: 1 });
        let limiter = RateLimiter::new(RateLimitConfig::default(), overrides);

        assert_eq!(limiter.remaining("noisy"), 1);
        assert!(limiter.check("noisy"));
        assert!(!limiter.check("noisy"));
        limiter.reset("noisy");
        assert!(limiter.check("noisy"));
        assert_eq!(limiter.remaining("quiet"), 20);
    }

    #[test]
    fn test_disabled_admits_everything() {
        let limiter = RateLimiter::disabled();
        for _ in 0..1000 {
            assert!(limiter.check("a"));
        }
    }
}
