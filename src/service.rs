//! The Palisade service object.
//!
//! Owns one instance of every admission component, built from a
//! [`PalisadeConfig`], plus the background janitors that keep their state
//! bounded.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerStats, CircuitBreaker};
use crate::budget::{Layer, TimeoutBudget};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendConfig, PalisadeConfig};
use crate::error::Result;
use crate::ratelimit::{CounterStore, MemoryStore, RateLimitDecision, RateLimiter, RedisStore, Tier};
use crate::retry::RetryExecutor;
use crate::session::{SessionDecision, SessionTracker};

/// Admission control and resilience primitives for one process.
pub struct Palisade {
    config: PalisadeConfig,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    sessions: Arc<SessionTracker>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    retry: RetryExecutor,
    shutdown: CancellationToken,
    janitors: Mutex<Vec<JoinHandle<()>>>,
}

impl Palisade {
    /// Build every component from `config` using the system clock.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the Redis backend
    /// cannot be reached.
    pub async fn new(config: PalisadeConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new())).await
    }

    pub async fn with_clock(config: PalisadeConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let rl = &config.rate_limiting;

        let store: Arc<dyn CounterStore> = match &rl.backend {
            BackendConfig::Memory => {
                warn!("Using in-memory counter store; limits are enforced per process");
                Arc::new(MemoryStore::new())
            }
            BackendConfig::Redis(redis) => Arc::new(RedisStore::connect(redis.clone()).await?),
        };

        let limiter = Arc::new(
            RateLimiter::new(store, Arc::clone(&clock), rl.rules.clone(), rl.strategy)
                .with_key_prefix(rl.key_prefix.clone())
                .with_fail_open(rl.fail_open),
        );
        let sessions = Arc::new(SessionTracker::new(config.sessions.clone(), Arc::clone(&clock)));
        let shutdown = CancellationToken::new();

        let janitors = vec![
            sessions.spawn_janitor(rl.janitor_interval, shutdown.child_token()),
            spawn_store_janitor(Arc::clone(&limiter), rl.janitor_interval, shutdown.child_token()),
        ];

        info!(
            backend = limiter.store().name(),
            strategy = ?rl.strategy,
            fail_open = rl.fail_open,
            "Palisade initialized"
        );

        Ok(Self {
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            clock,
            limiter,
            sessions,
            breakers: DashMap::new(),
            shutdown,
            janitors: Mutex::new(janitors),
        })
    }

    pub fn config(&self) -> &PalisadeConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Check and count one request against its tier limits.
    pub async fn allow(&self, identifier: &str, endpoint: &str, tier: Tier) -> RateLimitDecision {
        self.limiter.allow(identifier, endpoint, tier, None).await
    }

    /// Check one chat message for a session.
    pub fn check_session(&self, session_id: &str) -> SessionDecision {
        self.sessions.check(session_id)
    }

    /// The breaker named `name`, created with the configured defaults on first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "Created circuit breaker");
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.circuit_breaker.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    /// Stats of every breaker created so far, sorted by name.
    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// An executor for the configured retry policy.
    pub fn retry_executor(&self) -> RetryExecutor {
        self.retry.clone()
    }

    /// A fresh root budget for one request, sized by the `api` layer default.
    pub fn root_budget(&self) -> TimeoutBudget {
        let budgets = &self.config.budgets;
        TimeoutBudget::root_with(
            Layer::Api.as_str(),
            budgets.share(Layer::Api).default,
            budgets.clone(),
        )
    }

    /// Check that the counter store answers.
    pub async fn health(&self) -> Result<()> {
        self.limiter.store().ping().await
    }

    /// Stop the background janitors and wait for them to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.janitors.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Janitor task ended abnormally");
            }
        }
        info!("Palisade closed");
    }
}

/// Purge expired counters every `interval` until `shutdown` fires.
fn spawn_store_janitor(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Counter store janitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match limiter.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Purged expired counters"),
                        Err(e) => warn!(error = %e, "Failed to purge expired counters"),
                    }
                }
            }
        }
    })
}

impl Drop for Palisade {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Palisade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Palisade")
            .field("limiter", &self.limiter)
            .field("sessions", &self.sessions)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}
