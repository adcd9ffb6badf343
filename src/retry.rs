//! Retry with configurable backoff.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::budget;
use crate::error::{Classify, ErrorKind};

/// Lower bound for every computed delay.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Relative spread applied when jitter is enabled.
const JITTER_SPREAD: f64 = 0.25;

/// Largest Fibonacci index that fits in a `u64`; later terms saturate.
const FIB_MAX_INDEX: u32 = 93;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial_delay` every time
    Fixed,
    /// `initial_delay * multiplier^(attempt - 1)`
    #[default]
    Exponential,
    /// `initial_delay * attempt`
    Linear,
    /// Uniform in `[initial_delay, min(10 * initial_delay, max_delay)]`
    RandomJitter,
    /// `initial_delay * fib(attempt)`
    Fibonacci,
}

/// When and how to retry a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay", with = "crate::config::duration_secs")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Perturb each delay by up to ±25%
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// When non-empty, only these kinds are retried
    #[serde(default)]
    pub retry_on: Vec<ErrorKind>,
    /// Kinds that are never retried
    #[serde(default = "default_dont_retry_on")]
    pub dont_retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            retry_on: Vec::new(),
            dont_retry_on: default_dont_retry_on(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_dont_retry_on() -> Vec<ErrorKind> {
    vec![ErrorKind::RateLimited, ErrorKind::BudgetExceeded]
}

impl RetryPolicy {
    /// Whether a failure of `kind` on `attempt` (1-based) gets another try.
    ///
    /// An open circuit is never retried, whatever the lists say.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        if attempt >= self.max_attempts || kind == ErrorKind::CircuitOpen {
            return false;
        }
        if self.dont_retry_on.contains(&kind) {
            return false;
        }
        self.retry_on.is_empty() || self.retry_on.contains(&kind)
    }
}

/// What a retry hook is told about a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub error: String,
    /// Delay before the next attempt; `None` when giving up
    pub delay: Option<Duration>,
}

type Hook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Runs calls under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    fibonacci: Arc<Mutex<Vec<u64>>>,
    on_retry: Option<Hook>,
    on_failure: Option<Hook>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            fibonacci: Arc::new(Mutex::new(vec![0, 1, 1])),
            on_retry: None,
            on_failure: None,
        }
    }

    /// Called before each backoff sleep.
    pub fn on_retry(mut self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Called once when the executor gives up.
    pub fn on_failure(mut self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        self.policy.should_retry(kind, attempt)
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let policy = &self.policy;
        let attempt = attempt.max(1);
        let initial = policy.initial_delay.as_secs_f64();
        let max = policy.max_delay.max(MIN_DELAY).as_secs_f64();
        let mut rng = rand::thread_rng();

        let base = match policy.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                initial * policy.multiplier.powi(exp)
            }
            BackoffStrategy::Linear => initial * f64::from(attempt),
            BackoffStrategy::RandomJitter => {
                let upper = (initial * 10.0).min(max);
                if upper > initial {
                    rng.gen_range(initial..=upper)
                } else {
                    initial
                }
            }
            BackoffStrategy::Fibonacci => initial * self.fib(attempt) as f64,
        };

        let jittered = if policy.jitter {
            base * (1.0 + rng.gen_range(-JITTER_SPREAD..=JITTER_SPREAD))
        } else {
            base
        };

        // NaN and infinities from extreme multipliers end up at the bounds.
        let secs = if jittered.is_nan() {
            max
        } else {
            jittered.clamp(MIN_DELAY.as_secs_f64(), max)
        };
        Duration::from_secs_f64(secs)
    }

    /// Memoized Fibonacci number, `fib(1) = fib(2) = 1`.
    fn fib(&self, n: u32) -> u64 {
        if n > FIB_MAX_INDEX {
            return u64::MAX;
        }
        let n = n as usize;
        let mut memo = self.fibonacci.lock();
        while memo.len() <= n {
            let next = memo[memo.len() - 1].saturating_add(memo[memo.len() - 2]);
            memo.push(next);
        }
        memo[n]
    }

    /// Run `f` until it succeeds or the policy gives up.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_attempts(f).await.map(|(value, _)| value)
    }

    /// Like [`execute`](Self::execute), also reporting the attempts used.
    pub async fn execute_with_attempts<T, E, F, Fut>(&self, mut f: F) -> Result<(T, u32), E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let error = match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Call succeeded after retry");
                    }
                    return Ok((value, attempt));
                }
                Err(e) => e,
            };

            let Some(delay) = self.next_delay(&error, attempt) else {
                return Err(error);
            };
            if !budget_covers(delay) {
                self.give_up(&error, attempt);
                return Err(error);
            }
            self.announce_retry(&error, attempt, delay);
            if !pause(delay).await {
                self.give_up(&error, attempt);
                return Err(error);
            }
            attempt += 1;
        }
    }

    /// Blocking variant for synchronous call sites. Sleeps the current thread.
    pub fn execute_blocking<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            let error = match f() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let Some(delay) = self.next_delay(&error, attempt) else {
                return Err(error);
            };
            self.announce_retry(&error, attempt, delay);
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Retry a call guarded by `breaker`. Rejections by an open circuit end
    /// the loop immediately.
    pub async fn execute_guarded<T, E, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        mut f: F,
    ) -> Result<T, BreakerError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(move || {
            let call = f();
            breaker.call_async(move || call)
        })
        .await
    }

    /// Backoff before the next attempt, or `None` (after firing the failure
    /// hook) when the policy gives up.
    fn next_delay<E: Classify + fmt::Display>(&self, error: &E, attempt: u32) -> Option<Duration> {
        if !self.should_retry(error.kind(), attempt) {
            self.give_up(error, attempt);
            return None;
        }
        Some(self.calculate_delay(attempt))
    }

    fn announce_retry<E: Classify + fmt::Display>(
        &self,
        error: &E,
        attempt: u32,
        delay: Duration,
    ) {
        let kind = error.kind();
        debug!(
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            kind = ?kind,
            error = %error,
            "Retrying after failure"
        );
        if let Some(hook) = &self.on_retry {
            hook(&RetryEvent {
                attempt,
                kind,
                error: error.to_string(),
                delay: Some(delay),
            });
        }
    }

    fn give_up<E: Classify + fmt::Display>(&self, error: &E, attempt: u32) {
        let kind = error.kind();
        warn!(attempt, kind = ?kind, error = %error, "Giving up on call");
        if let Some(hook) = &self.on_failure {
            hook(&RetryEvent {
                attempt,
                kind,
                error: error.to_string(),
                delay: None,
            });
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Whether the ambient budget, if any, has more than `delay` left.
fn budget_covers(delay: Duration) -> bool {
    let Some(budget) = budget::current_budget() else {
        return true;
    };
    let remaining = budget.remaining();
    if remaining <= delay {
        debug!(
            layer = %budget.layer(),
            delay_ms = delay.as_millis() as u64,
            remaining_ms = remaining.as_millis() as u64,
            "Backoff exceeds remaining budget"
        );
        return false;
    }
    true
}

/// Backoff sleep, cut short when the ambient budget is cancelled.
async fn pause(delay: Duration) -> bool {
    let Some(budget) = budget::current_budget() else {
        tokio::time::sleep(delay).await;
        return true;
    };
    let token = budget.cancellation_token();
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::budget::{with_budget, TimeoutBudget};
    use crate::clock::MockClock;
    use crate::error::PalisadeError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(ErrorKind);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky: {:?}", self.0)
        }
    }

    impl Classify for Flaky {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        }
    }

    fn delays(strategy: BackoffStrategy) -> Vec<u64> {
        let executor = RetryExecutor::new(policy(strategy));
        (1..=5).map(|a| executor.calculate_delay(a).as_secs()).collect()
    }

    #[test]
    fn test_delay_per_strategy() {
        assert_eq!(delays(BackoffStrategy::Fixed), vec![1, 1, 1, 1, 1]);
        assert_eq!(delays(BackoffStrategy::Exponential), vec![1, 2, 4, 8, 16]);
        assert_eq!(delays(BackoffStrategy::Linear), vec![1, 2, 3, 4, 5]);
        assert_eq!(delays(BackoffStrategy::Fibonacci), vec![1, 1, 2, 3, 5]);
    }

    #[test]
    fn test_delay_clamped_to_bounds() {
        let mut p = policy(BackoffStrategy::Exponential);
        p.max_delay = Duration::from_secs(5);
        let executor = RetryExecutor::new(p);
        assert_eq!(executor.calculate_delay(10), Duration::from_secs(5));

        let mut p = policy(BackoffStrategy::Fixed);
        p.initial_delay = Duration::from_millis(10);
        let executor = RetryExecutor::new(p);
        assert_eq!(executor.calculate_delay(1), MIN_DELAY);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let mut p = policy(BackoffStrategy::Fixed);
        p.initial_delay = Duration::from_secs(4);
        p.jitter = true;
        let executor = RetryExecutor::new(p);
        for _ in 0..100 {
            let delay = executor.calculate_delay(1);
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_random_jitter_range() {
        let executor = RetryExecutor::new(policy(BackoffStrategy::RandomJitter));
        for _ in 0..100 {
            let delay = executor.calculate_delay(1);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_should_retry_lists() {
        let mut p = policy(BackoffStrategy::Fixed);
        assert!(p.should_retry(ErrorKind::Timeout, 1));
        assert!(!p.should_retry(ErrorKind::Timeout, 5));
        assert!(!p.should_retry(ErrorKind::RateLimited, 1));
        assert!(!p.should_retry(ErrorKind::CircuitOpen, 1));

        p.retry_on = vec![ErrorKind::Connection];
        assert!(p.should_retry(ErrorKind::Connection, 1));
        assert!(!p.should_retry(ErrorKind::Server, 1));

        p.dont_retry_on.clear();
        p.retry_on.clear();
        assert!(p.should_retry(ErrorKind::RateLimited, 1));
        assert!(!p.should_retry(ErrorKind::CircuitOpen, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_until_success() {
        let retries = Arc::new(AtomicU32::new(0));
        let hook_count = Arc::clone(&retries);
        let executor = RetryExecutor::new(policy(BackoffStrategy::Exponential))
            .on_retry(move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            });

        let calls = AtomicU32::new(0);
        let (value, attempts) = executor
            .execute_with_attempts(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky(ErrorKind::Timeout))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(attempts, 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_stops_on_terminal_error() {
        let failures = Arc::new(AtomicU32::new(0));
        let hook_count = Arc::clone(&failures);
        let executor = RetryExecutor::new(policy(BackoffStrategy::Fixed)).on_failure(move |event| {
            assert_eq!(event.kind, ErrorKind::RateLimited);
            assert!(event.delay.is_none());
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(ErrorKind::RateLimited))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_exhausts_attempts() {
        let executor = RetryExecutor::new(policy(BackoffStrategy::Linear));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(ErrorKind::Server))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 1 + 2 + 3 + 4 seconds of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_execution_stops_when_circuit_opens() {
        let clock = MockClock::at_epoch_secs(0);
        let breaker = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            Arc::new(clock),
        );
        let executor = RetryExecutor::new(policy(BackoffStrategy::Fixed));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute_guarded(&breaker, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(ErrorKind::Server))
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_respects_budget() {
        let executor = RetryExecutor::new(policy(BackoffStrategy::Fixed));
        let budget = TimeoutBudget::root(Duration::from_millis(1_500));
        budget.consume(Duration::from_secs(1)).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), PalisadeError> = with_budget(budget, async {
            executor
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PalisadeError::Store("unavailable".to_string()))
                })
                .await
        })
        .await;

        assert!(result.is_err());
        // A 1s backoff does not fit in the 0.5s left.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_counts_time_spent_in_running_budget() {
        let retries = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let (on_retry, on_failure) = (Arc::clone(&retries), Arc::clone(&failures));
        let executor = RetryExecutor::new(policy(BackoffStrategy::Fixed))
            .on_retry(move |_| {
                on_retry.fetch_add(1, Ordering::SeqCst);
            })
            .on_failure(move |_| {
                on_failure.fetch_add(1, Ordering::SeqCst);
            });
        let budget = TimeoutBudget::root(Duration::from_millis(1_500));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = budget
            .run(executor.execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err::<(), _>(PalisadeError::Store("unavailable".to_string()))
            }))
            .await
            .unwrap();

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Gave up right after the first call instead of waiting for the deadline.
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        // No retry was announced for the backoff that never happened.
        assert_eq!(retries.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fibonacci_delay_for_huge_attempt() {
        let executor = RetryExecutor::new(policy(BackoffStrategy::Fibonacci));
        assert_eq!(executor.calculate_delay(u32::MAX), Duration::from_secs(30));
        assert_eq!(executor.calculate_delay(94), Duration::from_secs(30));
        assert!(executor.fibonacci.lock().len() <= FIB_MAX_INDEX as usize + 1);
    }

    #[test]
    fn test_execute_blocking() {
        let mut p = policy(BackoffStrategy::Fixed);
        p.initial_delay = Duration::from_millis(100);
        let executor = RetryExecutor::new(p);
        let mut calls = 0;
        let result = executor.execute_blocking(|| {
            calls += 1;
            if calls < 2 {
                Err(Flaky(ErrorKind::Connection))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_policy_from_yaml() {
        let p: RetryPolicy =
            serde_yaml::from_str("strategy: fibonacci\nmax_attempts: 4\ninitial_delay: 0.5\n")
                .unwrap();
        assert_eq!(p.strategy, BackoffStrategy::Fibonacci);
        assert_eq!(p.initial_delay, Duration::from_millis(500));
        assert_eq!(p.dont_retry_on, default_dont_retry_on());
    }
}
