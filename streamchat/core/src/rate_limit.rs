//! Per-caller Token Bucket Rate Limiting
//!
//! Gates both connection admission (one token per request) and streaming
//! throughput (a fractional cost per relayed fragment). Both costs are drawn
//! from the same bucket, so a caller that streams a lot also exhausts its
//! budget for new requests.
//!
//! # Design
//!
//! - Buckets are created lazily per key, full, with the configured capacity
//! - Tokens refill continuously at `refill_per_second`, capped at capacity
//! - Acquisition never blocks and never queues; it answers immediately
//! - Each bucket sits behind its own mutex; the key table is a [`DashMap`]
//!   so unrelated keys never contend on a shared lock
//! - Idle buckets can be evicted; a recreated bucket is indistinguishable
//!   from one whose caller stayed idle long enough to refill completely
//!
//! # Usage
//!
//! ```
//! use streamchat_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(
//!     RateLimitConfig::new()
//!         .with_capacity(10.0)
//!         .with_refill_per_second(1.0),
//! );
//! assert!(limiter.try_acquire("demo-key-123", 1.0));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for per-caller rate limiting
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket can hold (burst size)
    pub capacity: f64,

    /// Tokens added per second
    pub refill_per_second: f64,

    /// Cost charged per relayed fragment (throughput shaping)
    pub token_cost: f64,

    /// Buckets unused for this many seconds may be evicted
    pub idle_eviction_secs: u64,

    /// Whether to enable rate limiting (can be disabled for testing)
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_per_second: 1.0,
            token_cost: 0.01,
            idle_eviction_secs: 600,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket capacity
    #[must_use]
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the refill rate in tokens per second
    #[must_use]
    pub fn with_refill_per_second(mut self, rate: f64) -> Self {
        self.refill_per_second = rate;
        self
    }

    /// Set the per-fragment throughput cost
    #[must_use]
    pub fn with_token_cost(mut self, cost: f64) -> Self {
        self.token_cost = cost;
        self
    }

    /// Set the idle eviction window
    #[must_use]
    pub fn with_idle_eviction(mut self, window: Duration) -> Self {
        self.idle_eviction_secs = window.as_secs();
        self
    }

    /// Enable or disable rate limiting
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Idle eviction window as a [`Duration`]
    #[must_use]
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Tight limits for shared deployments
    #[must_use]
    pub fn strict() -> Self {
        Self {
            capacity: 10.0,
            refill_per_second: 0.2,
            token_cost: 0.02,
            idle_eviction_secs: 300,
            enabled: true,
        }
    }

    /// Loose limits for trusted environments
    #[must_use]
    pub fn relaxed() -> Self {
        Self {
            capacity: 600.0,
            refill_per_second: 10.0,
            token_cost: 0.001,
            idle_eviction_secs: 1800,
            enabled: true,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Result of a rate limit check
#[derive(Clone, Debug, PartialEq)]
pub enum RateLimitResult {
    /// Request admitted; tokens were deducted
    Allowed {
        /// Tokens left in the bucket after deduction
        remaining: f64,
    },

    /// Request rejected; bucket left untouched apart from refill
    Rejected {
        /// Time until the bucket would hold enough tokens
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Check if the request was admitted
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Check if the request was rejected
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Get the retry hint if rejected
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after } => Some(*retry_after),
            Self::Allowed { .. } => None,
        }
    }
}

// =============================================================================
// Token Bucket
// =============================================================================

/// Token bucket state for a single key
///
/// Refill is a pure function of elapsed time, so state only changes when the
/// bucket is consulted.
#[derive(Clone, Debug)]
pub struct RateBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl RateBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(capacity: f64, refill_per_second: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            refill_per_second: refill_per_second.max(0.0),
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    /// Current token count (without refilling)
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Bucket capacity
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Apply refill for the time elapsed since the last refill
    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take `cost` tokens
    pub fn try_take(&mut self, cost: f64, now: Instant) -> RateLimitResult {
        let cost = cost.max(0.0);
        self.refill(now);
        self.last_used = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            RateLimitResult::Allowed {
                remaining: self.tokens,
            }
        } else {
            RateLimitResult::Rejected {
                retry_after: self.time_until(cost),
            }
        }
    }

    /// Take up to `cost` tokens, never going below zero
    ///
    /// Returns the amount actually deducted.
    pub fn drain(&mut self, cost: f64, now: Instant) -> f64 {
        let cost = cost.max(0.0);
        self.refill(now);
        self.last_used = now;

        let taken = cost.min(self.tokens);
        self.tokens -= taken;
        taken
    }

    /// Time until `cost` tokens are available
    fn time_until(&self, cost: f64) -> Duration {
        if cost > self.capacity || self.refill_per_second <= 0.0 {
            return Duration::MAX;
        }
        let deficit = (cost - self.tokens).max(0.0);
        Duration::try_from_secs_f64(deficit / self.refill_per_second).unwrap_or(Duration::MAX)
    }

    /// Whether the bucket has been unused for at least `window`
    #[must_use]
    pub fn is_idle(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= window
    }
}

// =============================================================================
// Keyed Rate Limiter
// =============================================================================

/// Keyed token bucket rate limiter
///
/// Cloning the limiter is not supported; share it behind an [`Arc`].
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<RateBucket>>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Fetch or lazily create the bucket for `key`
    ///
    /// The table shard lock is released before the bucket is locked.
    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<RateBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(key = %key, "Creating rate bucket");
                Arc::new(Mutex::new(RateBucket::new(
                    self.config.capacity,
                    self.config.refill_per_second,
                    now,
                )))
            });
        Arc::clone(bucket.value())
    }

    /// Try to acquire `cost` tokens for `key` now
    pub fn try_acquire(&self, key: &str, cost: f64) -> bool {
        self.try_acquire_at(key, cost, Instant::now())
    }

    /// Try to acquire `cost` tokens for `key` at a given instant
    pub fn try_acquire_at(&self, key: &str, cost: f64, now: Instant) -> bool {
        self.check(key, cost, now).is_allowed()
    }

    /// Try to acquire and report remaining tokens or the retry hint
    pub fn check(&self, key: &str, cost: f64, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: self.config.capacity,
            };
        }

        let bucket = self.bucket(key, now);
        let result = bucket.lock().try_take(cost, now);
        if let RateLimitResult::Rejected { retry_after } = &result {
            tracing::debug!(
                key = %key,
                cost = cost,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "Rate limit rejected"
            );
        }
        result
    }

    /// Charge throughput cost, saturating at an empty bucket
    ///
    /// Returns the amount actually deducted.
    pub fn charge(&self, key: &str, cost: f64) -> f64 {
        self.charge_at(key, cost, Instant::now())
    }

    /// Charge throughput cost at a given instant
    pub fn charge_at(&self, key: &str, cost: f64, now: Instant) -> f64 {
        if !self.config.enabled {
            return 0.0;
        }
        let bucket = self.bucket(key, now);
        let mut bucket = bucket.lock();
        bucket.drain(cost, now)
    }

    /// Tokens available to `key` at `now` (capacity if no bucket exists)
    #[must_use]
    pub fn available(&self, key: &str, now: Instant) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => {
                let mut bucket = bucket.lock();
                bucket.refill(now);
                bucket.tokens()
            }
            None => self.config.capacity,
        }
    }

    /// Drop buckets idle for longer than the configured window
    ///
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let window = self.config.idle_eviction();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.lock().is_idle(now, window));
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted = evicted, "Evicted idle rate buckets");
        }
        evicted
    }

    /// Number of live buckets
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("bucket_count", &self.buckets.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn limiter(capacity: f64, rate: f64) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::new()
                .with_capacity(capacity)
                .with_refill_per_second(rate),
        )
    }

    #[test]
    fn test_config_default() {
        let config = RateLimitConfig::default();
        assert!((config.capacity - 60.0).abs() < f64::EPSILON);
        assert!((config.refill_per_second - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.idle_eviction(), Duration::from_secs(600));
        assert!(config.enabled);
    }

    #[test]
    fn test_config_presets() {
        assert!(!RateLimitConfig::disabled().enabled);
        assert!(RateLimitConfig::strict().capacity < RateLimitConfig::relaxed().capacity);
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = limiter(10.0, 1.0);
        let t0 = Instant::now();

        for i in 0..10 {
            assert!(limiter.try_acquire_at("k", 1.0, t0), "call {i} should pass");
        }
        assert!(!limiter.try_acquire_at("k", 1.0, t0));

        let t1 = t0 + Duration::from_secs(1);
        assert!(limiter.try_acquire_at("k", 1.0, t1));
        assert!(!limiter.try_acquire_at("k", 1.0, t1));
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let limiter = limiter(5.0, 2.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("k", 5.0, t0));

        let later = t0 + Duration::from_secs(3600);
        assert!((limiter.available("k", later) - 5.0).abs() < 1e-9);
        assert!(!limiter.try_acquire_at("k", 5.5, later));
    }

    #[test]
    fn test_rejection_leaves_tokens_unchanged() {
        let limiter = limiter(3.0, 1.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("k", 2.0, t0));
        assert!(!limiter.try_acquire_at("k", 2.0, t0));
        assert!((limiter.available("k", t0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_retry_after_hint() {
        let limiter = limiter(2.0, 4.0);
        let t0 = Instant::now();
        assert!(limiter.check("k", 2.0, t0).is_allowed());

        let result = limiter.check("k", 1.0, t0);
        assert!(result.is_rejected());
        assert_eq!(result.retry_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_cost_above_capacity_never_admitted() {
        let limiter = limiter(2.0, 1.0);
        let result = limiter.check("k", 3.0, Instant::now());
        assert_eq!(result.retry_after(), Some(Duration::MAX));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1.0, 1.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("alice", 1.0, t0));
        assert!(!limiter.try_acquire_at("alice", 1.0, t0));
        assert!(limiter.try_acquire_at("bob", 1.0, t0));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_fractional_costs_share_bucket() {
        let limiter = limiter(1.0, 0.0);
        let t0 = Instant::now();
        for _ in 0..4 {
            assert!(limiter.try_acquire_at("k", 0.25, t0));
        }
        assert!(!limiter.try_acquire_at("k", 0.25, t0));
    }

    #[test]
    fn test_charge_saturates_at_zero() {
        let limiter = limiter(1.0, 0.0);
        let t0 = Instant::now();
        let taken = limiter.charge_at("k", 0.75, t0);
        assert!((taken - 0.75).abs() < 1e-9);
        let taken = limiter.charge_at("k", 0.75, t0);
        assert!((taken - 0.25).abs() < 1e-9);
        assert!(limiter.available("k", t0).abs() < 1e-9);
        assert!(!limiter.try_acquire_at("k", 1.0, t0));
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig::disabled().with_capacity(1.0));
        let t0 = Instant::now();
        for _ in 0..100 {
            assert!(limiter.try_acquire_at("k", 1.0, t0));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_evict_idle() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .with_capacity(2.0)
                .with_idle_eviction(Duration::from_secs(60)),
        );
        let t0 = Instant::now();
        limiter.try_acquire_at("old", 2.0, t0);
        limiter.try_acquire_at("fresh", 1.0, t0 + Duration::from_secs(50));

        let evicted = limiter.evict_idle(t0 + Duration::from_secs(61));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.bucket_count(), 1);

        // A recreated bucket starts full
        assert!(limiter.try_acquire_at("old", 2.0, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_negative_cost_treated_as_zero() {
        let limiter = limiter(1.0, 0.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("k", -5.0, t0));
        assert!((limiter.available("k", t0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_acquire_never_overdraws() {
        let limiter = Arc::new(limiter(100.0, 0.0));
        let t0 = Instant::now();

        let admitted: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    scope.spawn(move || {
                        (0..50)
                            .filter(|_| limiter.try_acquire_at("shared", 1.0, t0))
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 100);
        assert!(limiter.available("shared", t0) >= 0.0);
    }

    #[test]
    fn test_debug_impl() {
        let limiter = limiter(1.0, 1.0);
        let debug = format!("{limiter:?}");
        assert!(debug.contains("RateLimiter"));
        assert!(debug.contains("bucket_count"));
    }
}
