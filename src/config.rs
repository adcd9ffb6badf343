//! Configuration management for Palisade.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables of the form `PALISADE__SECTION__FIELD`
//! (e.g. `PALISADE__CIRCUIT_BREAKER__FAILURE_THRESHOLD=10`). Durations are
//! written as fractional seconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::budget::{BudgetConfig, Layer};
use crate::error::{PalisadeError, Result};
use crate::ratelimit::{RateLimitRules, RedisStoreConfig, Strategy, DEFAULT_KEY_PREFIX};
use crate::retry::RetryPolicy;
use crate::session::SessionLimitConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PALISADE";

/// Main configuration for Palisade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PalisadeConfig {
    /// Request rate limiting
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Per-session abuse tracking
    #[serde(default)]
    pub sessions: SessionLimitConfig,

    /// Defaults for every circuit breaker created by the service
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-layer timeout budget shares
    #[serde(default)]
    pub budgets: BudgetConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Prefix for every counter store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Allow requests when the counter store is unreachable
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    /// How often expired counters and idle sessions are purged
    #[serde(default = "default_janitor_interval", with = "duration_secs")]
    pub janitor_interval: Duration,

    /// Tier limit overrides and endpoint overrides
    #[serde(flatten)]
    pub rules: RateLimitRules,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            backend: BackendConfig::default(),
            key_prefix: default_key_prefix(),
            fail_open: default_fail_open(),
            janitor_interval: default_janitor_interval(),
            rules: RateLimitRules::default(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_fail_open() -> bool {
    true
}

fn default_janitor_interval() -> Duration {
    Duration::from_secs(60)
}

/// Where rate limit counters live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process; limits are per instance
    #[default]
    Memory,
    /// Shared through Redis
    Redis(RedisStoreConfig),
}

impl PalisadeConfig {
    /// Load from an optional YAML file plus `PALISADE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: PalisadeConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| PalisadeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PalisadeConfig =
            serde_yaml::from_str(yaml).map_err(|e| PalisadeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(PalisadeError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.required_successes == 0 {
            return Err(PalisadeError::Config(
                "circuit_breaker.required_successes must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PalisadeError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier > 0.0) {
            return Err(PalisadeError::Config(
                "retry.multiplier must be a positive number".to_string(),
            ));
        }
        for layer in Layer::ALL {
            let fraction = self.budgets.share(layer).fraction;
            if !(0.0..=1.0).contains(&fraction) {
                return Err(PalisadeError::Config(format!(
                    "budgets.{}.fraction must be within [0, 1], got {}",
                    layer, fraction
                )));
            }
        }
        if self.rate_limiting.janitor_interval.is_zero() {
            return Err(PalisadeError::Config(
                "rate_limiting.janitor_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for a `Duration` written as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for an `Option<Duration>` written as fractional seconds.
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
