//! Error types for Palisade.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::DenyReason;

/// Main error type for Palisade operations.
#[derive(Error, Debug)]
pub enum PalisadeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An identifier exceeded one of its rate limits
    #[error("Rate limit exceeded ({reason})")]
    RateLimitExceeded {
        reason: DenyReason,
        retry_after: Duration,
    },

    /// The session is blocked after repeated violations
    #[error("Session blocked, retry after {retry_after:?}")]
    SessionBlocked { retry_after: Duration },

    /// The session is temporarily throttled
    #[error("Session throttled, retry after {retry_after:?}")]
    SessionThrottled { retry_after: Duration },

    /// A circuit breaker rejected the call without invoking it
    #[error("Circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// A layer ran out of its timeout budget
    #[error("Budget exceeded in layer '{layer}' (total {total:?}, elapsed {elapsed:?})")]
    BudgetExceeded {
        layer: String,
        total: Duration,
        elapsed: Duration,
    },

    /// A parent budget was cancelled while this layer was running
    #[error("Budget cancelled in layer '{layer}'")]
    BudgetCancelled { layer: String },

    /// Counter store errors not covered by a more specific variant
    #[error("Store error: {0}")]
    Store(String),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Palisade operations.
pub type Result<T> = std::result::Result<T, PalisadeError>;

impl PalisadeError {
    /// HTTP status code an API boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            PalisadeError::RateLimitExceeded { .. }
            | PalisadeError::SessionBlocked { .. }
            | PalisadeError::SessionThrottled { .. } => 429,
            PalisadeError::CircuitOpen { .. } => 503,
            PalisadeError::BudgetExceeded { .. } | PalisadeError::BudgetCancelled { .. } => 504,
            _ => 500,
        }
    }

    /// Value for a `Retry-After` header, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PalisadeError::RateLimitExceeded { retry_after, .. }
            | PalisadeError::SessionBlocked { retry_after }
            | PalisadeError::SessionThrottled { retry_after }
            | PalisadeError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Coarse classification of a failure.
///
/// Retry policies and circuit breaker filters match on these kinds, so they can
/// be listed in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    RateLimited,
    Server,
    Client,
    CircuitOpen,
    BudgetExceeded,
    Other,
}

/// Errors that can report their [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for PalisadeError {
    fn kind(&self) -> ErrorKind {
        match self {
            PalisadeError::RateLimitExceeded { .. }
            | PalisadeError::SessionBlocked { .. }
            | PalisadeError::SessionThrottled { .. } => ErrorKind::RateLimited,
            PalisadeError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PalisadeError::BudgetExceeded { .. } | PalisadeError::BudgetCancelled { .. } => {
                ErrorKind::BudgetExceeded
            }
            PalisadeError::Redis(e) if e.is_timeout() => ErrorKind::Timeout,
            PalisadeError::Redis(e) if e.is_io_error() || e.is_connection_dropped() => {
                ErrorKind::Connection
            }
            PalisadeError::Io(e) => Classify::kind(e),
            PalisadeError::Config(_) => ErrorKind::Client,
            _ => ErrorKind::Other,
        }
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match std::io::Error::kind(self) {
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::UnexpectedEof => ErrorKind::Connection,
            Io::InvalidInput | Io::InvalidData | Io::PermissionDenied | Io::NotFound => {
                ErrorKind::Client
            }
            _ => ErrorKind::Other,
        }
    }
}
