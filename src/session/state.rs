//! Per-session state and limits.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Lifecycle of a chat session as seen by the abuse tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Fewer than `active_after_messages` accepted messages
    New,
    /// Regular traffic
    Active,
    /// Long-lived, well-behaved session
    Warm,
    /// Denied until `throttle_until`
    Throttled,
    /// Denied until `block_until`
    Blocked,
}

/// Limits and penalties applied to every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLimitConfig {
    /// Accepted messages per trailing minute
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    /// Accepted messages per trailing hour
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    /// Messages allowed within `burst_window`
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
    #[serde(default = "default_burst_window", with = "crate::config::duration_secs")]
    pub burst_window: Duration,
    /// Violations that put a session in `Throttled`
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: u32,
    /// Violations that put a session in `Blocked`
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,
    #[serde(default = "default_throttle_duration", with = "crate::config::duration_secs")]
    pub throttle_duration: Duration,
    #[serde(default = "default_block_duration", with = "crate::config::duration_secs")]
    pub block_duration: Duration,
    /// Accepted messages after which a `New` session becomes `Active`
    #[serde(default = "default_active_after_messages")]
    pub active_after_messages: u64,
    /// Accepted messages after which an `Active` session may become `Warm`
    #[serde(default = "default_warm_after_messages")]
    pub warm_after_messages: u64,
    /// Minimum session age before it may become `Warm`
    #[serde(default = "default_warm_after_age", with = "crate::config::duration_secs")]
    pub warm_after_age: Duration,
    /// Every this many accepted messages, one violation is forgiven
    #[serde(default = "default_decay_every")]
    pub decay_every: u64,
    /// Idle time after which a session is evicted
    #[serde(default = "default_inactivity_ttl", with = "crate::config::duration_secs")]
    pub inactivity_ttl: Duration,
}

impl Default for SessionLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            burst_limit: default_burst_limit(),
            burst_window: default_burst_window(),
            throttle_threshold: default_throttle_threshold(),
            block_threshold: default_block_threshold(),
            throttle_duration: default_throttle_duration(),
            block_duration: default_block_duration(),
            active_after_messages: default_active_after_messages(),
            warm_after_messages: default_warm_after_messages(),
            warm_after_age: default_warm_after_age(),
            decay_every: default_decay_every(),
            inactivity_ttl: default_inactivity_ttl(),
        }
    }
}

fn default_per_minute() -> u32 {
    20
}

fn default_per_hour() -> u32 {
    300
}

fn default_burst_limit() -> u32 {
    5
}

fn default_burst_window() -> Duration {
    Duration::from_secs(10)
}

fn default_throttle_threshold() -> u32 {
    3
}

fn default_block_threshold() -> u32 {
    5
}

fn default_throttle_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_block_duration() -> Duration {
    Duration::from_secs(900)
}

fn default_active_after_messages() -> u64 {
    3
}

fn default_warm_after_messages() -> u64 {
    20
}

fn default_warm_after_age() -> Duration {
    Duration::from_secs(600)
}

fn default_decay_every() -> u64 {
    10
}

fn default_inactivity_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Tracked state of one session. Times are offsets from the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub status: SessionStatus,
    pub message_count: u64,
    pub violation_count: u32,
    /// Accepted message times, oldest first, at most 24h old
    pub timestamps: VecDeque<Duration>,
    pub first_seen: Duration,
    pub last_seen: Duration,
    pub throttle_until: Option<Duration>,
    pub block_until: Option<Duration>,
}

/// How long accepted message times are kept.
pub const TIMESTAMP_RETENTION: Duration = Duration::from_secs(24 * 3600);

impl SessionState {
    pub fn new(session_id: &str, now: Duration) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::New,
            message_count: 0,
            violation_count: 0,
            timestamps: VecDeque::new(),
            first_seen: now,
            last_seen: now,
            throttle_until: None,
            block_until: None,
        }
    }

    /// Accepted messages in `(now - span, now]`.
    pub fn count_since(&self, now: Duration, span: Duration) -> usize {
        let cutoff = now.saturating_sub(span);
        // Timestamps are sorted, so walk from the newest end.
        self.timestamps.iter().rev().take_while(|&&t| t > cutoff).count()
    }

    /// Oldest accepted message still inside `(now - span, now]`.
    pub fn oldest_since(&self, now: Duration, span: Duration) -> Option<Duration> {
        let cutoff = now.saturating_sub(span);
        self.timestamps.iter().copied().find(|&t| t > cutoff)
    }

    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.first_seen)
    }

    pub(crate) fn prune(&mut self, now: Duration) {
        let cutoff = now.saturating_sub(TIMESTAMP_RETENTION);
        while self.timestamps.front().is_some_and(|&t| t <= cutoff) {
            self.timestamps.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_since_and_oldest() {
        let mut state = SessionState::new("s", Duration::from_secs(100));
        for t in [100, 105, 109, 111] {
            state.timestamps.push_back(Duration::from_secs(t));
        }
        let now = Duration::from_secs(112);
        assert_eq!(state.count_since(now, Duration::from_secs(10)), 3);
        assert_eq!(
            state.oldest_since(now, Duration::from_secs(10)),
            Some(Duration::from_secs(105))
        );
    }

    #[test]
    fn test_prune_drops_day_old_entries() {
        let mut state = SessionState::new("s", Duration::ZERO);
        state.timestamps.push_back(Duration::from_secs(10));
        state.timestamps.push_back(Duration::from_secs(50_000));
        state.prune(Duration::from_secs(10 + 24 * 3600));
        assert_eq!(state.timestamps.len(), 1);
    }

    #[test]
    fn test_config_from_yaml_uses_defaults() {
        let config: SessionLimitConfig =
            serde_yaml::from_str("burst_limit: 3\nburst_window: 2.5\n").unwrap();
        assert_eq!(config.burst_limit, 3);
        assert_eq!(config.burst_window, Duration::from_millis(2_500));
        assert_eq!(config.block_threshold, 5);
    }
}
