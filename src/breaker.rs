//! Circuit breaker for calls to unreliable collaborators.
//!
//! `Closed` counts consecutive failures and opens at `failure_threshold`.
//! `Open` rejects every call until `recovery_timeout` has passed since the
//! last failure, then lets calls through in `HalfOpen`. In `HalfOpen` one
//! failure reopens the circuit and `required_successes` consecutive successes
//! close it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Classify, ErrorKind, PalisadeError};
use crate::ratelimit::millis_to_datetime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open after the last failure
    #[serde(default = "default_recovery_timeout", with = "crate::config::duration_secs")]
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    #[serde(default = "default_required_successes")]
    pub required_successes: u32,
    /// Failure kinds that count against the circuit. Empty counts every failure.
    #[serde(default)]
    pub expected: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            required_successes: default_required_successes(),
            expected: Vec::new(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_required_successes() -> u32 {
    3
}

impl CircuitBreakerConfig {
    fn counts(&self, kind: ErrorKind) -> bool {
        self.expected.is_empty() || self.expected.contains(&kind)
    }
}

/// Error returned by a guarded call.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit rejected the call; the wrapped function never ran
    Open { name: String, retry_after: Duration },
    /// The wrapped function failed
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The wrapped function's error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { name, retry_after } => {
                write!(f, "Circuit '{}' is open, retry after {:?}", name, retry_after)
            }
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E: Classify> Classify for BreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            BreakerError::Open { .. } => ErrorKind::CircuitOpen,
            BreakerError::Inner(e) => e.kind(),
        }
    }
}

impl<E: Into<PalisadeError>> From<BreakerError<E>> for PalisadeError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { name, retry_after } => {
                PalisadeError::CircuitOpen { name, retry_after }
            }
            BreakerError::Inner(e) => e.into(),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Duration>,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

/// A circuit breaker guarding one call site.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An expired `Open` only turns `HalfOpen` on the next call.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner
                .last_failure_at
                .map(|t| millis_to_datetime(t.as_millis() as u64)),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Force the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_at = None;
        info!(breaker = %self.name, "Circuit reset");
    }

    /// Run a synchronous call through the breaker.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        E: Classify,
        F: FnOnce() -> Result<T, E>,
    {
        self.acquire()?;
        let result = f();
        self.record(&result);
        result.map_err(BreakerError::Inner)
    }

    /// Run an asynchronous call through the breaker.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire()?;
        let result = f().await;
        self.record(&result);
        result.map_err(BreakerError::Inner)
    }

    /// Admit a call or reject it while the circuit is open.
    fn acquire<E>(&self) -> Result<(), BreakerError<E>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let since_failure = inner
                .last_failure_at
                .map_or(self.config.recovery_timeout, |at| now.saturating_sub(at));
            if since_failure < self.config.recovery_timeout {
                inner.rejected_calls += 1;
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_after: self.config.recovery_timeout - since_failure,
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!(breaker = %self.name, "Circuit half-open, probing");
        }

        inner.total_calls += 1;
        Ok(())
    }

    fn record<T, E: Classify>(&self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.on_success(),
            Err(e) => {
                let kind = e.kind();
                if self.config.counts(kind) {
                    self.on_failure();
                } else {
                    debug!(breaker = %self.name, kind = ?kind, "Ignoring unexpected failure kind");
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.required_successes {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "Circuit closed");
                }
            }
            // A call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        recovery_secs = self.config.recovery_timeout.as_secs_f64(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.last_failure_at = Some(now);
                warn!(breaker = %self.name, "Probe failed, circuit reopened");
            }
            CircuitState::Open => inner.last_failure_at = Some(now),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
