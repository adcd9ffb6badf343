//! Call-tree layers and how much of the parent budget each one gets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A layer of the request call tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Api,
    Service,
    Agent,
    ExternalApi,
    Database,
}

impl Layer {
    pub const ALL: [Layer; 5] = [
        Layer::Api,
        Layer::Service,
        Layer::Agent,
        Layer::ExternalApi,
        Layer::Database,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Api => "api",
            Layer::Service => "service",
            Layer::Agent => "agent",
            Layer::ExternalApi => "external_api",
            Layer::Database => "database",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Share of the parent's remaining budget given to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerShare {
    /// Fraction of the parent's remaining budget, in `[0, 1]`
    pub fraction: f64,
    /// Upper bound on the derived budget
    #[serde(default, with = "crate::config::option_duration_secs")]
    pub cap: Option<Duration>,
    /// Budget used when there is no parent
    #[serde(with = "crate::config::duration_secs")]
    pub default: Duration,
}

impl LayerShare {
    pub const fn new(fraction: f64, cap: Option<Duration>, default: Duration) -> Self {
        Self {
            fraction,
            cap,
            default,
        }
    }

    /// Budget derived from a parent with `remaining` left. Never exceeds it.
    pub fn derive(&self, remaining: Duration) -> Duration {
        let fraction = if self.fraction.is_nan() {
            0.0
        } else {
            self.fraction.clamp(0.0, 1.0)
        };
        let share = remaining.mul_f64(fraction);
        match self.cap {
            Some(cap) => share.min(cap),
            None => share,
        }
    }
}

/// Per-layer shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub api: LayerShare,
    pub service: LayerShare,
    pub agent: LayerShare,
    pub external_api: LayerShare,
    pub database: LayerShare,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            api: LayerShare::new(1.0, None, Duration::from_secs(30)),
            service: LayerShare::new(0.9, None, Duration::from_secs(28)),
            agent: LayerShare::new(0.85, None, Duration::from_secs(25)),
            external_api: LayerShare::new(
                0.4,
                Some(Duration::from_secs(10)),
                Duration::from_secs(10),
            ),
            database: LayerShare::new(0.2, Some(Duration::from_secs(5)), Duration::from_secs(5)),
        }
    }
}

impl BudgetConfig {
    pub fn share(&self, layer: Layer) -> &LayerShare {
        match layer {
            Layer::Api => &self.api,
            Layer::Service => &self.service,
            Layer::Agent => &self.agent,
            Layer::ExternalApi => &self.external_api,
            Layer::Database => &self.database,
        }
    }
}
