//! Per-session abuse tracking.
//!
//! Every message runs through a fixed sequence of checks:
//!
//! 1. An active block denies.
//! 2. An expired block demotes the session to `Throttled` with the violation
//!    count reset to the throttle threshold.
//! 3. An active throttle denies.
//! 4. An expired throttle promotes the session back to `Active`.
//! 5. A full burst window records a violation and may escalate to a throttle
//!    or a block.
//! 6. Per-minute and per-hour limits deny without touching the session.
//! 7. Otherwise the message is accepted and recorded.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{SessionLimitConfig, SessionState, SessionStatus};
use crate::clock::Clock;
use crate::error::PalisadeError;
use crate::ratelimit::{ceil_secs, DenyReason};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Outcome of a session check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Status after the check
    pub status: SessionStatus,
    pub violation_count: u32,
    pub message_count: u64,
    /// Per-minute message limit
    pub limit: u32,
    /// Messages left in the trailing minute
    pub remaining: u32,
    /// When the oldest message in the trailing minute falls out of it
    #[serde(with = "crate::config::duration_secs")]
    pub reset_at: Duration,
    #[serde(with = "crate::config::option_duration_secs")]
    pub retry_after: Option<Duration>,
}

impl SessionDecision {
    /// Response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-Session-RateLimit-Limit", self.limit.to_string()),
            ("X-Session-RateLimit-Remaining", self.remaining.to_string()),
            ("X-Session-RateLimit-Reset", ceil_secs(self.reset_at).to_string()),
        ];
        if let Some(retry_after) = self.retry_after.filter(|_| !self.allowed) {
            headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
        }
        headers
    }

    /// Convert a denial into an error for `?`-style call sites.
    pub fn into_result(self) -> Result<Self, PalisadeError> {
        if self.allowed {
            return Ok(self);
        }
        let retry_after = self.retry_after.unwrap_or_default();
        Err(match self.reason {
            Some(DenyReason::SessionBlocked) => PalisadeError::SessionBlocked { retry_after },
            Some(DenyReason::SessionThrottled) => PalisadeError::SessionThrottled { retry_after },
            reason => PalisadeError::RateLimitExceeded {
                reason: reason.unwrap_or(DenyReason::BurstLimitExceeded),
                retry_after,
            },
        })
    }
}

/// Tracks every live session and applies progressive penalties.
///
/// Checks for the same session are serialized by the map's entry lock;
/// different sessions never contend on the same state.
pub struct SessionTracker {
    sessions: DashMap<String, SessionState>,
    config: SessionLimitConfig,
    clock: Arc<dyn Clock>,
}

impl SessionTracker {
    pub fn new(config: SessionLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &SessionLimitConfig {
        &self.config
    }

    /// Check one incoming message for `session_id`, recording it if accepted.
    pub fn check(&self, session_id: &str) -> SessionDecision {
        let now = self.clock.now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id, now));
        self.evaluate(entry.value_mut(), now)
    }

    /// Snapshot of a session's state.
    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Forget a session entirely.
    pub fn reset(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict sessions idle for longer than `inactivity_ttl`.
    ///
    /// Sessions still serving a block are kept so that reconnecting after
    /// the idle period does not lift the penalty.
    pub fn purge_inactive(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.inactivity_ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, state| {
            let blocked = state.block_until.is_some_and(|until| now < until);
            blocked || now.saturating_sub(state.last_seen) <= ttl
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, remaining = self.sessions.len(), "Evicted inactive sessions");
        }
        removed
    }

    /// Run [`purge_inactive`](Self::purge_inactive) every `interval` until
    /// `shutdown` is cancelled.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session janitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        tracker.purge_inactive();
                    }
                }
            }
        })
    }

    fn evaluate(&self, state: &mut SessionState, now: Duration) -> SessionDecision {
        let config = &self.config;

        if state.status == SessionStatus::Blocked {
            match state.block_until {
                Some(until) if now < until => {
                    return self.deny(state, now, DenyReason::SessionBlocked, until - now);
                }
                _ => {
                    // Demotion starts no new timer; the next check promotes to active.
                    state.status = SessionStatus::Throttled;
                    state.violation_count = config.throttle_threshold;
                    state.throttle_until = None;
                    state.block_until = None;
                    info!(
                        session_id = %state.session_id,
                        violations = state.violation_count,
                        "Session block expired, demoted to throttled"
                    );
                }
            }
        }

        if state.status == SessionStatus::Throttled {
            match state.throttle_until {
                Some(until) if now < until => {
                    return self.deny(state, now, DenyReason::SessionThrottled, until - now);
                }
                _ => {
                    state.status = SessionStatus::Active;
                    state.throttle_until = None;
                    debug!(session_id = %state.session_id, "Session throttle expired");
                }
            }
        }

        if state.count_since(now, config.burst_window) >= config.burst_limit as usize {
            state.violation_count += 1;
            let retry_after = if state.violation_count >= config.block_threshold {
                state.status = SessionStatus::Blocked;
                state.block_until = Some(now + config.block_duration);
                warn!(
                    session_id = %state.session_id,
                    violations = state.violation_count,
                    block_secs = config.block_duration.as_secs(),
                    "Session blocked"
                );
                config.block_duration
            } else if state.violation_count >= config.throttle_threshold {
                state.status = SessionStatus::Throttled;
                state.throttle_until = Some(now + config.throttle_duration);
                warn!(
                    session_id = %state.session_id,
                    violations = state.violation_count,
                    "Session throttled"
                );
                config.throttle_duration
            } else {
                debug!(
                    session_id = %state.session_id,
                    violations = state.violation_count,
                    "Session burst limit exceeded"
                );
                until_released(state, now, config.burst_window)
            };
            return self.deny(state, now, DenyReason::BurstLimitExceeded, retry_after);
        }

        if state.count_since(now, MINUTE) >= config.per_minute as usize {
            let retry_after = until_released(state, now, MINUTE);
            return self.deny(state, now, DenyReason::PerMinuteLimitExceeded, retry_after);
        }
        if state.count_since(now, HOUR) >= config.per_hour as usize {
            let retry_after = until_released(state, now, HOUR);
            return self.deny(state, now, DenyReason::PerHourLimitExceeded, retry_after);
        }

        self.accept(state, now)
    }

    fn accept(&self, state: &mut SessionState, now: Duration) -> SessionDecision {
        let config = &self.config;
        state.timestamps.push_back(now);
        state.prune(now);
        state.message_count += 1;
        state.last_seen = now;

        match state.status {
            SessionStatus::New if state.message_count >= config.active_after_messages => {
                state.status = SessionStatus::Active;
            }
            SessionStatus::Active
                if state.message_count >= config.warm_after_messages
                    && state.age(now) >= config.warm_after_age =>
            {
                state.status = SessionStatus::Warm;
                debug!(session_id = %state.session_id, "Session warmed up");
            }
            _ => {}
        }

        if config.decay_every > 0
            && state.message_count % config.decay_every == 0
            && state.violation_count > 0
        {
            state.violation_count -= 1;
            debug!(
                session_id = %state.session_id,
                violations = state.violation_count,
                "Session violation decayed"
            );
        }

        self.decision(state, now, None, None)
    }

    fn deny(
        &self,
        state: &SessionState,
        now: Duration,
        reason: DenyReason,
        retry_after: Duration,
    ) -> SessionDecision {
        self.decision(state, now, Some(reason), Some(retry_after))
    }

    fn decision(
        &self,
        state: &SessionState,
        now: Duration,
        reason: Option<DenyReason>,
        retry_after: Option<Duration>,
    ) -> SessionDecision {
        let used = state.count_since(now, MINUTE) as u32;
        let reset_at = state
            .oldest_since(now, MINUTE)
            .map_or(now + MINUTE, |oldest| oldest + MINUTE);

        SessionDecision {
            allowed: reason.is_none(),
            reason,
            status: state.status,
            violation_count: state.violation_count,
            message_count: state.message_count,
            limit: self.config.per_minute,
            remaining: self.config.per_minute.saturating_sub(used),
            reset_at,
            retry_after,
        }
    }
}

/// Time until the oldest message inside `span` falls out of it.
fn until_released(state: &SessionState, now: Duration, span: Duration) -> Duration {
    state
        .oldest_since(now, span)
        .map_or(span, |oldest| (oldest + span).saturating_sub(now))
}

impl std::fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTracker")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}
