//! Tier limits, endpoint overrides and effective-limit resolution.
//!
//! Limits resolve per window as `tier ⊓ endpoint override ⊓ custom`, where `⊓`
//! takes the smaller of two configured limits. An override can only tighten a
//! tier limit, never widen it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::counter::TimeWindow;
use crate::error::{PalisadeError, Result};

/// A named rate-limit profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
    Unlimited,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Free,
        Tier::Basic,
        Tier::Pro,
        Tier::Enterprise,
        Tier::Unlimited,
    ];

    /// Built-in limits for this tier.
    ///
    /// `per_second` is left unset: `burst` is the one-second cap, allowing
    /// short spikes above the per-minute rate.
    pub fn default_limits(&self) -> LimitSet {
        match self {
            Tier::Free => LimitSet::new(None, Some(20), Some(200), Some(1_000), Some(3)),
            Tier::Basic => LimitSet::new(None, Some(60), Some(1_000), Some(10_000), Some(5)),
            Tier::Pro => LimitSet::new(None, Some(300), Some(5_000), Some(50_000), Some(10)),
            Tier::Enterprise => {
                LimitSet::new(None, Some(1_000), Some(20_000), Some(200_000), Some(50))
            }
            Tier::Unlimited => LimitSet::UNLIMITED,
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = PalisadeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            "unlimited" => Ok(Tier::Unlimited),
            other => Err(PalisadeError::Config(format!("Unknown tier '{}'", other))),
        }
    }
}

/// A partial limit tuple. `None` means "no limit for this window".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u64>,
    /// Requests allowed within one second on top of the window checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,
}

impl LimitSet {
    pub const UNLIMITED: LimitSet = LimitSet {
        per_second: None,
        per_minute: None,
        per_hour: None,
        per_day: None,
        burst: None,
    };

    pub const fn new(
        per_second: Option<u64>,
        per_minute: Option<u64>,
        per_hour: Option<u64>,
        per_day: Option<u64>,
        burst: Option<u64>,
    ) -> Self {
        Self {
            per_second,
            per_minute,
            per_hour,
            per_day,
            burst,
        }
    }

    /// Limit configured for `window`, if any.
    pub fn get(&self, window: TimeWindow) -> Option<u64> {
        match window {
            TimeWindow::Second => self.per_second,
            TimeWindow::Minute => self.per_minute,
            TimeWindow::Hour => self.per_hour,
            TimeWindow::Day => self.per_day,
        }
    }

    /// Windows that carry a limit, shortest first.
    pub fn windows(&self) -> impl Iterator<Item = (TimeWindow, u64)> + '_ {
        TimeWindow::ALL
            .into_iter()
            .filter_map(|w| self.get(w).map(|limit| (w, limit)))
    }

    /// The more restrictive of two limit sets, per window.
    pub fn intersect(&self, other: &LimitSet) -> LimitSet {
        fn min(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            }
        }

        LimitSet {
            per_second: min(self.per_second, other.per_second),
            per_minute: min(self.per_minute, other.per_minute),
            per_hour: min(self.per_hour, other.per_hour),
            per_day: min(self.per_day, other.per_day),
            burst: min(self.burst, other.burst),
        }
    }

    /// Replace the fields that `other` sets, keeping the rest.
    pub fn overlay(&self, other: &LimitSet) -> LimitSet {
        LimitSet {
            per_second: other.per_second.or(self.per_second),
            per_minute: other.per_minute.or(self.per_minute),
            per_hour: other.per_hour.or(self.per_hour),
            per_day: other.per_day.or(self.per_day),
            burst: other.burst.or(self.burst),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == LimitSet::UNLIMITED
    }
}

/// Process-wide tier table.
///
/// Deserializes from a map of per-tier overrides which are laid over the
/// built-in defaults field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "HashMap<Tier, LimitSet>", into = "HashMap<Tier, LimitSet>")]
pub struct TierTable {
    limits: HashMap<Tier, LimitSet>,
}

impl TierTable {
    /// A table holding the built-in limits.
    pub fn new() -> Self {
        Self {
            limits: Tier::ALL
                .into_iter()
                .map(|tier| (tier, tier.default_limits()))
                .collect(),
        }
    }

    /// Replace a tier's limits entirely.
    pub fn with_tier(mut self, tier: Tier, limits: LimitSet) -> Self {
        self.limits.insert(tier, limits);
        self
    }

    /// Lay partial overrides over the current limits.
    pub fn apply_overrides(&mut self, overrides: &HashMap<Tier, LimitSet>) {
        for (tier, partial) in overrides {
            let current = self.get(*tier);
            self.limits.insert(*tier, current.overlay(partial));
        }
    }

    pub fn get(&self, tier: Tier) -> LimitSet {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_limits())
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new()
    }
}

impl From<HashMap<Tier, LimitSet>> for TierTable {
    fn from(overrides: HashMap<Tier, LimitSet>) -> Self {
        let mut table = TierTable::new();
        table.apply_overrides(&overrides);
        table
    }
}

impl From<TierTable> for HashMap<Tier, LimitSet> {
    fn from(table: TierTable) -> Self {
        table.limits
    }
}

/// Per-endpoint limit override.
///
/// `pattern` is either an exact endpoint (`/api/chat`) or a prefix ending in
/// `*` (`/api/reports*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointOverride {
    pub pattern: String,
    #[serde(flatten)]
    pub limits: LimitSet,
}

impl EndpointOverride {
    pub fn new(pattern: impl Into<String>, limits: LimitSet) -> Self {
        Self {
            pattern: pattern.into(),
            limits,
        }
    }

    /// Match specificity against `endpoint`; higher is more specific.
    fn specificity(&self, endpoint: &str) -> Option<usize> {
        match self.pattern.strip_suffix('*') {
            Some(prefix) if endpoint.starts_with(prefix) => Some(prefix.len()),
            Some(_) => None,
            None if self.pattern == endpoint => Some(usize::MAX),
            None => None,
        }
    }
}

/// The complete rule set evaluated by the rate limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRules {
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub endpoints: Vec<EndpointOverride>,
}

impl RateLimitRules {
    pub fn new(tiers: TierTable, endpoints: Vec<EndpointOverride>) -> Self {
        Self { tiers, endpoints }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PalisadeError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// The most specific override matching `endpoint`.
    ///
    /// Exact patterns beat prefixes; among prefixes the longest wins.
    pub fn find_override(&self, endpoint: &str) -> Option<&EndpointOverride> {
        self.endpoints
            .iter()
            .filter_map(|o| o.specificity(endpoint).map(|s| (s, o)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, o)| o)
    }

    /// Effective limits for one request.
    pub fn effective_limits(
        &self,
        tier: Tier,
        endpoint: &str,
        custom: Option<&LimitSet>,
    ) -> LimitSet {
        let mut limits = self.tiers.get(tier);
        if let Some(endpoint_override) = self.find_override(endpoint) {
            limits = limits.intersect(&endpoint_override.limits);
        }
        if let Some(custom) = custom {
            limits = limits.intersect(custom);
        }
        limits
    }
}
