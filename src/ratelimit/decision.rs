//! Admission decisions and their response headers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::counter::{TimeWindow, WindowStatus};
use crate::error::PalisadeError;

/// Why a request or message was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    BurstLimitExceeded,
    PerSecondLimitExceeded,
    PerMinuteLimitExceeded,
    PerHourLimitExceeded,
    PerDayLimitExceeded,
    SessionBlocked,
    SessionThrottled,
    /// The counter store failed and the limiter is configured to fail closed
    BackendUnavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::BurstLimitExceeded => "burst_limit_exceeded",
            DenyReason::PerSecondLimitExceeded => "per_second_limit_exceeded",
            DenyReason::PerMinuteLimitExceeded => "per_minute_limit_exceeded",
            DenyReason::PerHourLimitExceeded => "per_hour_limit_exceeded",
            DenyReason::PerDayLimitExceeded => "per_day_limit_exceeded",
            DenyReason::SessionBlocked => "session_blocked",
            DenyReason::SessionThrottled => "session_throttled",
            DenyReason::BackendUnavailable => "backend_unavailable",
        }
    }

    pub(crate) fn for_window(window: TimeWindow) -> Self {
        match window {
            TimeWindow::Second => DenyReason::PerSecondLimitExceeded,
            TimeWindow::Minute => DenyReason::PerMinuteLimitExceeded,
            TimeWindow::Hour => DenyReason::PerHourLimitExceeded,
            TimeWindow::Day => DenyReason::PerDayLimitExceeded,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Status of every evaluated window
    pub windows: BTreeMap<TimeWindow, WindowStatus>,
    /// Status of the burst allowance, when one applies
    pub burst: Option<WindowStatus>,
    /// The counter store failed and the decision did not consult it
    pub degraded: bool,
    /// How long the caller should wait before retrying a denied request
    #[serde(with = "crate::config::option_duration_secs")]
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// An allow with no limits evaluated.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            reason: None,
            windows: BTreeMap::new(),
            burst: None,
            degraded: false,
            retry_after: None,
        }
    }

    /// The decision taken when the counter store is unreachable.
    pub fn degraded(fail_open: bool) -> Self {
        Self {
            allowed: fail_open,
            reason: (!fail_open).then_some(DenyReason::BackendUnavailable),
            windows: BTreeMap::new(),
            burst: None,
            degraded: true,
            retry_after: (!fail_open).then_some(Duration::from_secs(1)),
        }
    }

    /// The window whose metadata belongs in response headers.
    ///
    /// For a denial this is the denying window that resets last; otherwise the
    /// window with the fewest remaining requests.
    pub fn most_restrictive(&self) -> Option<&WindowStatus> {
        let all = self.windows.values().chain(self.burst.iter());
        if self.allowed {
            all.min_by_key(|s| (s.remaining, s.reset_at))
        } else {
            all.filter(|s| !s.allowed).max_by_key(|s| s.reset_at)
        }
    }

    /// Response headers for this decision.
    ///
    /// `Retry-After` is only present on denials.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(status) = self.most_restrictive() {
            headers.push(("X-RateLimit-Limit", status.limit.to_string()));
            headers.push(("X-RateLimit-Remaining", status.remaining.to_string()));
            headers.push(("X-RateLimit-Reset", status.reset_at.timestamp().to_string()));
        }
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
        Err(PalisadeError::RateLimitExceeded {
            reason: self.reason.unwrap_or(DenyReason::BackendUnavailable),
            retry_after: self.retry_after.unwrap_or_default(),
        })
    }
}

/// Whole seconds, rounded up, as used by `Retry-After`.
pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
