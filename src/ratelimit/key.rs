//! Counter key generation.

use super::counter::TimeWindow;

/// Which counter of an `(identifier, endpoint)` pair a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterScope {
    /// One of the regular time windows
    Window(TimeWindow),
    /// The short burst allowance
    Burst,
}

impl CounterScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterScope::Window(window) => window.as_str(),
            CounterScope::Burst => "burst",
        }
    }
}

/// A key that uniquely identifies a window counter.
///
/// Composed of the caller identifier, the endpoint and the counter scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The caller being limited (API key, user id, IP, ...)
    pub identifier: String,
    /// The endpoint the request targets
    pub endpoint: String,
    /// The counter within the pair
    pub scope: CounterScope,
}

impl CounterKey {
    pub fn new(identifier: &str, endpoint: &str, scope: CounterScope) -> Self {
        Self {
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
            scope,
        }
    }

    /// Render the key used in the counter store.
    ///
    /// Format: `{prefix}{identifier}:{endpoint}:{scope}`
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}{}:{}:{}",
            prefix,
            self.identifier,
            self.endpoint,
            self.scope.as_str()
        )
    }

    /// Render the key of one fixed-window bucket.
    ///
    /// Format: `{prefix}{identifier}:{endpoint}:{scope}:{bucket_start_ms}`
    pub fn to_bucket_key(&self, prefix: &str, bucket_start_millis: u64) -> String {
        format!("{}:{}", self.to_store_key(prefix), bucket_start_millis)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_store_key(""))
    }
}
