//! Time windows and per-window counter status.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// All windows, shortest first.
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::Second,
        TimeWindow::Minute,
        TimeWindow::Hour,
        TimeWindow::Day,
    ];

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Short label used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }

    /// Start of the fixed-window bucket containing `now`, in milliseconds.
    pub fn bucket_start_millis(&self, now: Duration) -> u64 {
        let len = self.duration().as_millis() as u64;
        (now.as_millis() as u64 / len) * len
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    /// Effective limit for the window
    pub limit: u64,
    /// Requests left before the window denies
    pub remaining: u64,
    /// When the window frees capacity again
    pub reset_at: DateTime<Utc>,
    /// Whether this window admitted the request
    pub allowed: bool,
}

impl WindowStatus {
    pub(crate) fn new(limit: u64, remaining: u64, reset_at_millis: u64, allowed: bool) -> Self {
        Self {
            limit,
            remaining,
            reset_at: millis_to_datetime(reset_at_millis),
            allowed,
        }
    }

    /// Time from `now` until the window resets, never negative.
    pub fn reset_after(&self, now: Duration) -> Duration {
        let reset = self.reset_at.timestamp_millis().max(0) as u64;
        Duration::from_millis(reset.saturating_sub(now.as_millis() as u64))
    }
}

pub(crate) fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
