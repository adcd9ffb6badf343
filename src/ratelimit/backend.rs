//! Counter store trait for abstracting local and distributed state.
//!
//! The rate limiter owns the algorithms; a store only provides the atomic
//! per-key primitives each strategy needs. Both implementations must give
//! identical answers for identical inputs, so every primitive receives the
//! current time from the caller instead of reading a clock itself.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;

/// Shape of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Maximum number of tokens the bucket holds
    pub capacity: f64,
    /// Tokens added per millisecond
    pub refill_per_ms: f64,
    /// How long an idle bucket is kept
    pub ttl: Duration,
}

impl BucketSpec {
    /// A bucket that refills `limit` tokens over `window`.
    pub fn for_window(limit: u64, window: Duration) -> Self {
        let window_ms = window.as_millis().max(1) as f64;
        Self {
            capacity: limit as f64,
            refill_per_ms: limit as f64 / window_ms,
            ttl: window,
        }
    }

    /// Milliseconds until the bucket holds `target` tokens, starting from `tokens`.
    pub fn millis_until(&self, tokens: f64, target: f64) -> u64 {
        if tokens >= target || self.refill_per_ms <= 0.0 {
            return 0;
        }
        ((target - tokens) / self.refill_per_ms).ceil() as u64
    }
}

/// Bucket state after a take attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub allowed: bool,
    /// Tokens left after the attempt
    pub tokens: f64,
}

/// Refill a bucket to `now` and try to take one token.
///
/// Returns the outcome and the new token count. The Redis script mirrors this
/// exactly.
pub fn refill_and_take(
    tokens: f64,
    last_refill_ms: u64,
    now_ms: u64,
    spec: &BucketSpec,
) -> BucketState {
    let elapsed = now_ms.saturating_sub(last_refill_ms) as f64;
    let refilled = (tokens + elapsed * spec.refill_per_ms).min(spec.capacity);
    if refilled >= 1.0 {
        BucketState {
            allowed: true,
            tokens: refilled - 1.0,
        }
    } else {
        BucketState {
            allowed: false,
            tokens: refilled,
        }
    }
}

/// Trait for counter store implementations.
///
/// Every method is atomic for a single key: concurrent calls on the same key
/// never lose updates.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Increment a fixed-window counter and return the new count.
    ///
    /// The counter expires `ttl` after `now` when it is first created.
    async fn increment(&self, key: &str, now: Duration, ttl: Duration) -> Result<u64>;

    /// Record a request at `now` in a sliding log and return how many requests
    /// fall within `(now - window, now]`.
    async fn record_and_count(&self, key: &str, now: Duration, window: Duration) -> Result<u64>;

    /// Refill a token bucket to `now` and try to take one token.
    async fn take_token(&self, key: &str, now: Duration, spec: BucketSpec) -> Result<BucketState>;

    /// Drop expired entries, returning how many were removed.
    ///
    /// Stores with native expiry may return `Ok(0)`.
    async fn purge_expired(&self, now: Duration) -> Result<usize>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_spec_for_window() {
        let spec = BucketSpec::for_window(60, Duration::from_secs(60));
        assert_eq!(spec.capacity, 60.0);
        assert!((spec.refill_per_ms - 0.001).abs() < f64::EPSILON);
        assert_eq!(spec.millis_until(0.0, 1.0), 1_000);
        assert_eq!(spec.millis_until(2.0, 1.0), 0);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let spec = BucketSpec::for_window(5, Duration::from_secs(5));
        let state = refill_and_take(0.0, 0, 60_000, &spec);
        assert!(state.allowed);
        assert_eq!(state.tokens, 4.0);
    }

    #[test]
    fn test_refill_denies_below_one_token() {
        let spec = BucketSpec::for_window(1, Duration::from_secs(10));
        let state = refill_and_take(0.0, 0, 5_000, &spec);
        assert!(!state.allowed);
        assert!((state.tokens - 0.5).abs() < 1e-9);
    }
}
