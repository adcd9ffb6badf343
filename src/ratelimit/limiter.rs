//! Core rate limiter implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{BucketSpec, CounterStore};
use super::counter::{TimeWindow, WindowStatus};
use super::decision::{DenyReason, RateLimitDecision};
use super::key::{CounterKey, CounterScope};
use super::rules::{LimitSet, RateLimitRules, Tier};
use crate::clock::Clock;
use crate::error::Result;

/// Span over which the burst allowance is counted.
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Default prefix for counter store keys.
pub const DEFAULT_KEY_PREFIX: &str = "palisade:rl:";

/// Window evaluation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter per aligned bucket of the window length
    FixedWindow,
    /// Log of request times over the trailing window
    #[default]
    SlidingWindow,
    /// Continuously refilled bucket with `limit` capacity
    TokenBucket,
    /// Same formula as `TokenBucket`
    LeakyBucket,
}

/// Multi-window, multi-strategy rate limiter.
///
/// Safe to share across tasks. The counter store is injected, so the same
/// limiter logic runs against the in-memory or the Redis store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    rules: RwLock<RateLimitRules>,
    strategy: Strategy,
    key_prefix: String,
    fail_open: bool,
}

impl RateLimiter {
    /// Create a limiter that fails open and uses the default key prefix.
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        rules: RateLimitRules,
        strategy: Strategy,
    ) -> Self {
        Self {
            store,
            clock,
            rules: RwLock::new(rules),
            strategy,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            fail_open: true,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Choose what happens when the store is unreachable: allow (`true`) or deny.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Replace the rule set.
    pub fn set_rules(&self, rules: RateLimitRules) {
        *self.rules.write() = rules;
    }

    /// Get a copy of the current rule set.
    pub fn rules(&self) -> RateLimitRules {
        self.rules.read().clone()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Check and count one request.
    ///
    /// Every window with an effective limit is evaluated, plus the burst
    /// allowance. The request is allowed only if all of them allow it.
    pub async fn allow(
        &self,
        identifier: &str,
        endpoint: &str,
        tier: Tier,
        custom: Option<&LimitSet>,
    ) -> RateLimitDecision {
        let limits = self.rules.read().effective_limits(tier, endpoint, custom);
        if limits.is_unlimited() {
            return RateLimitDecision::unlimited();
        }

        let now = self.clock.now();
        trace!(
            identifier = %identifier,
            endpoint = %endpoint,
            tier = ?tier,
            strategy = ?self.strategy,
            "Checking rate limit"
        );

        match self.evaluate(identifier, endpoint, &limits, now).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    backend = self.store.name(),
                    error = %e,
                    fail_open = self.fail_open,
                    identifier = %identifier,
                    "Counter store unavailable, rate limit degraded"
                );
                RateLimitDecision::degraded(self.fail_open)
            }
        }
    }

    /// Like [`allow`](Self::allow), turning a denial into an error.
    pub async fn check(
        &self,
        identifier: &str,
        endpoint: &str,
        tier: Tier,
    ) -> Result<RateLimitDecision> {
        self.allow(identifier, endpoint, tier, None).await.into_result()
    }

    /// Drop expired counters from stores without native expiry.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired(self.clock.now()).await
    }

    async fn evaluate(
        &self,
        identifier: &str,
        endpoint: &str,
        limits: &LimitSet,
        now: Duration,
    ) -> Result<RateLimitDecision> {
        let mut decision = RateLimitDecision::unlimited();

        if let Some(burst) = limits.burst {
            let key = CounterKey::new(identifier, endpoint, CounterScope::Burst);
            decision.burst = Some(self.sliding_window(&key, BURST_WINDOW, burst, now).await?);
        }

        let buckets = matches!(self.strategy, Strategy::TokenBucket | Strategy::LeakyBucket);
        for (window, limit) in limits.windows() {
            // Shortest window first; once one denies, longer buckets keep their tokens.
            let denied = decision.burst.is_some_and(|s| !s.allowed)
                || decision.windows.values().any(|s| !s.allowed);
            if buckets && denied {
                break;
            }
            let key = CounterKey::new(identifier, endpoint, CounterScope::Window(window));
            let status = match self.strategy {
                Strategy::FixedWindow => self.fixed_window(&key, window, limit, now).await?,
                Strategy::SlidingWindow => {
                    self.sliding_window(&key, window.duration(), limit, now).await?
                }
                Strategy::TokenBucket | Strategy::LeakyBucket => {
                    self.token_bucket(&key, window.duration(), limit, now).await?
                }
            };
            decision.windows.insert(window, status);
        }

        let burst_denied = decision.burst.is_some_and(|s| !s.allowed);
        let denied_window = decision
            .windows
            .iter()
            .filter(|(_, s)| !s.allowed)
            .max_by_key(|(_, s)| s.reset_at)
            .map(|(w, _)| *w);

        decision.reason = if burst_denied {
            Some(DenyReason::BurstLimitExceeded)
        } else {
            denied_window.map(DenyReason::for_window)
        };
        decision.allowed = decision.reason.is_none();

        if !decision.allowed {
            decision.retry_after = decision.most_restrictive().map(|s| s.reset_after(now));
            debug!(
                identifier = %identifier,
                endpoint = %endpoint,
                reason = ?decision.reason,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn fixed_window(
        &self,
        key: &CounterKey,
        window: TimeWindow,
        limit: u64,
        now: Duration,
    ) -> Result<WindowStatus> {
        let bucket_start = window.bucket_start_millis(now);
        let length = window.duration();
        let store_key = key.to_bucket_key(&self.key_prefix, bucket_start);

        let count = self.store.increment(&store_key, now, length).await?;
        Ok(WindowStatus::new(
            limit,
            limit.saturating_sub(count),
            bucket_start + length.as_millis() as u64,
            count <= limit,
        ))
    }

    async fn sliding_window(
        &self,
        key: &CounterKey,
        length: Duration,
        limit: u64,
        now: Duration,
    ) -> Result<WindowStatus> {
        let store_key = key.to_store_key(&self.key_prefix);
        let count = self.store.record_and_count(&store_key, now, length).await?;
        Ok(WindowStatus::new(
            limit,
            limit.saturating_sub(count),
            (now + length).as_millis() as u64,
            count <= limit,
        ))
    }

    async fn token_bucket(
        &self,
        key: &CounterKey,
        length: Duration,
        limit: u64,
        now: Duration,
    ) -> Result<WindowStatus> {
        let spec = BucketSpec::for_window(limit, length);
        let store_key = key.to_store_key(&self.key_prefix);
        let state = self.store.take_token(&store_key, now, spec).await?;

        // Allowed: report when the bucket is full again. Denied: when the next token lands.
        let target = if state.allowed { spec.capacity } else { 1.0 };
        let reset_at = now.as_millis() as u64 + spec.millis_until(state.tokens, target);
        Ok(WindowStatus::new(
            limit,
            state.tokens.floor().max(0.0) as u64,
            reset_at,
            state.allowed,
        ))
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("strategy", &self.strategy)
            .field("key_prefix", &self.key_prefix)
            .field("fail_open", &self.fail_open)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::PalisadeError;
    use crate::ratelimit::backend::BucketState;
    use crate::ratelimit::rules::{EndpointOverride, TierTable};
    use crate::ratelimit::MemoryStore;
    use async_trait::async_trait;

    // Aligned to the minute so fixed buckets start at the clock origin.
    const T0: u64 = 1_800_000_000;

    fn rules_with(tier: Tier, limits: LimitSet) -> RateLimitRules {
        RateLimitRules::new(TierTable::new().with_tier(tier, limits), Vec::new())
    }

    fn limiter(strategy: Strategy, rules: RateLimitRules) -> (RateLimiter, MockClock) {
        let clock = MockClock::at_epoch_secs(T0);
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
            rules,
            strategy,
        );
        (limiter, clock)
    }

    async fn run(limiter: &RateLimiter, n: usize) -> Vec<RateLimitDecision> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(limiter.allow("user-1", "/api/chat", Tier::Basic, None).await);
        }
        out
    }

    #[tokio::test]
    async fn test_limit_boundary_for_window_strategies() {
        for strategy in [Strategy::FixedWindow, Strategy::SlidingWindow] {
            let rules = rules_with(Tier::Basic, LimitSet::new(None, Some(5), None, None, None));
            let (limiter, _) = limiter(strategy, rules);

            let decisions = run(&limiter, 6).await;
            assert!(decisions[..5].iter().all(|d| d.allowed), "{:?}", strategy);
            assert!(!decisions[5].allowed, "{:?}", strategy);
            assert_eq!(decisions[5].reason, Some(DenyReason::PerMinuteLimitExceeded));
            assert_eq!(decisions[4].windows[&TimeWindow::Minute].remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_fixed_window_resets_on_next_bucket() {
        let rules = rules_with(Tier::Basic, LimitSet::new(None, Some(2), None, None, None));
        let (limiter, clock) = limiter(Strategy::FixedWindow, rules);

        assert!(run(&limiter, 3).await.iter().filter(|d| d.allowed).count() == 2);
        clock.advance(Duration::from_secs(60));
        assert!(run(&limiter, 1).await[0].allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_releases_gradually() {
        let rules = rules_with(Tier::Basic, LimitSet::new(None, Some(2), None, None, None));
        let (limiter, clock) = limiter(Strategy::SlidingWindow, rules);

        assert!(run(&limiter, 1).await[0].allowed);
        clock.advance(Duration::from_secs(30));
        assert!(run(&limiter, 1).await[0].allowed);
        clock.advance(Duration::from_secs(31));
        // The first request has aged out; the second is still inside the window.
        let decision = run(&limiter, 1).await.remove(0);
        assert!(decision.allowed);
        assert_eq!(decision.windows[&TimeWindow::Minute].remaining, 0);
    }

    #[tokio::test]
    async fn test_token_bucket_refills_after_idle() {
        for strategy in [Strategy::TokenBucket, Strategy::LeakyBucket] {
            let rules = rules_with(Tier::Basic, LimitSet::new(None, Some(60), None, None, None));
            let (limiter, clock) = limiter(strategy, rules);

            assert_eq!(run(&limiter, 61).await.iter().filter(|d| d.allowed).count(), 60);

            // One token per second; three seconds of idling buy three requests.
            clock.advance(Duration::from_secs(3));
            let decisions = run(&limiter, 4).await;
            assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 3);
            assert!(!decisions[3].allowed);
            assert!(decisions[3].retry_after.unwrap() <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_token_bucket_idle_bounded_by_capacity() {
        let rules = rules_with(Tier::Basic, LimitSet::new(Some(2), None, None, None, None));
        let (limiter, clock) = limiter(Strategy::TokenBucket, rules);

        run(&limiter, 2).await;
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(run(&limiter, 5).await.iter().filter(|d| d.allowed).count(), 2);
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_drain_longer_buckets() {
        let rules = rules_with(Tier::Basic, LimitSet::new(Some(2), Some(10), None, None, None));
        let (limiter, clock) = limiter(Strategy::TokenBucket, rules);

        let decisions = run(&limiter, 6).await;
        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 2);
        assert_eq!(decisions[5].reason, Some(DenyReason::PerSecondLimitExceeded));
        assert!(!decisions[5].windows.contains_key(&TimeWindow::Minute));

        // Only the two admitted requests were charged to the minute bucket.
        clock.advance(Duration::from_secs(1));
        let next = limiter.allow("user-1", "/api/chat", Tier::Basic, None).await;
        assert!(next.allowed);
        assert_eq!(next.windows[&TimeWindow::Minute].remaining, 7);
    }

    #[tokio::test]
    async fn test_burst_enforced_for_every_strategy() {
        for strategy in [
            Strategy::FixedWindow,
            Strategy::SlidingWindow,
            Strategy::TokenBucket,
        ] {
            let rules = rules_with(Tier::Basic, LimitSet::new(None, Some(60), None, None, Some(10)));
            let (limiter, clock) = limiter(strategy, rules);

            let mut decisions = Vec::new();
            for _ in 0..11 {
                decisions.push(limiter.allow("user-1", "/api/chat", Tier::Basic, None).await);
                clock.advance(Duration::from_millis(50));
            }
            assert!(decisions[..10].iter().all(|d| d.allowed), "{:?}", strategy);
            assert!(!decisions[10].allowed);
            assert_eq!(decisions[10].reason, Some(DenyReason::BurstLimitExceeded));
        }
    }

    #[tokio::test]
    async fn test_endpoint_override_tightens_limit() {
        let rules = RateLimitRules::new(
            TierTable::new().with_tier(Tier::Basic, LimitSet::new(None, Some(100), None, None, None)),
            vec![EndpointOverride::new(
                "/api/reports*",
                LimitSet::new(None, Some(1), None, None, None),
            )],
        );
        let (limiter, _) = limiter(Strategy::SlidingWindow, rules);

        assert!(limiter.allow("u", "/api/reports/1", Tier::Basic, None).await.allowed);
        assert!(!limiter.allow("u", "/api/reports/1", Tier::Basic, None).await.allowed);
        assert!(limiter.allow("u", "/api/chat", Tier::Basic, None).await.allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let rules = rules_with(Tier::Basic, LimitSet::new(None, Some(1), None, None, None));
        let (limiter, _) = limiter(Strategy::FixedWindow, rules);

        assert!(limiter.allow("a", "/e", Tier::Basic, None).await.allowed);
        assert!(limiter.allow("b", "/e", Tier::Basic, None).await.allowed);
        assert!(!limiter.allow("a", "/e", Tier::Basic, None).await.allowed);
    }

    #[tokio::test]
    async fn test_unlimited_tier_skips_store() {
        let (limiter, _) = limiter(Strategy::SlidingWindow, RateLimitRules::default());
        let decision = limiter.allow("u", "/e", Tier::Unlimited, None).await;
        assert!(decision.allowed);
        assert!(decision.windows.is_empty());
    }

    #[tokio::test]
    async fn test_check_returns_error_on_denial() {
        let rules = rules_with(Tier::Basic, LimitSet::new(Some(1), None, None, None, None));
        let (limiter, _) = limiter(Strategy::FixedWindow, rules);

        tokio_test::assert_ok!(limiter.check("u", "/e", Tier::Basic).await);
        let err = tokio_test::assert_err!(limiter.check("u", "/e", Tier::Basic).await);
        assert!(matches!(
            err,
            PalisadeError::RateLimitExceeded {
                reason: DenyReason::PerSecondLimitExceeded,
                ..
            }
        ));
    }

    #[derive(Debug)]
    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn increment(&self, _: &str, _: Duration, _: Duration) -> Result<u64> {
            Err(PalisadeError::Store("connection refused".to_string()))
        }
        async fn record_and_count(&self, _: &str, _: Duration, _: Duration) -> Result<u64> {
            Err(PalisadeError::Store("connection refused".to_string()))
        }
        async fn take_token(&self, _: &str, _: Duration, _: BucketSpec) -> Result<BucketState> {
            Err(PalisadeError::Store("connection refused".to_string()))
        }
        async fn purge_expired(&self, _: Duration) -> Result<usize> {
            Ok(0)
        }
        async fn ping(&self) -> Result<()> {
            Err(PalisadeError::Store("connection refused".to_string()))
        }
        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let limiter = RateLimiter::new(
            Arc::new(UnreachableStore),
            Arc::new(MockClock::at_epoch_secs(T0)),
            RateLimitRules::default(),
            Strategy::SlidingWindow,
        );
        let decision = limiter.allow("u", "/e", Tier::Free, None).await;
        assert!(decision.allowed);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_closed() {
        let limiter = RateLimiter::new(
            Arc::new(UnreachableStore),
            Arc::new(MockClock::at_epoch_secs(T0)),
            RateLimitRules::default(),
            Strategy::FixedWindow,
        )
        .with_fail_open(false);
        let decision = limiter.allow("u", "/e", Tier::Free, None).await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.reason, Some(DenyReason::BackendUnavailable));
    }

    #[tokio::test]
    async fn test_set_rules_takes_effect() {
        let (limiter, _) = limiter(Strategy::SlidingWindow, RateLimitRules::default());
        limiter.set_rules(rules_with(Tier::Pro, LimitSet::new(None, None, Some(1), None, None)));

        assert!(limiter.allow("u", "/e", Tier::Pro, None).await.allowed);
        let denied = limiter.allow("u", "/e", Tier::Pro, None).await;
        assert_eq!(denied.reason, Some(DenyReason::PerHourLimitExceeded));
    }
}
