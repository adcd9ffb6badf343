//! Session abuse tracking.
//!
//! Layered on top of request rate limiting: each chat session gets its own
//! message history and an escalating penalty state
//! (`New -> Active -> Warm`, with `Throttled` and `Blocked` on abuse).

pub mod state;
pub mod tracker;

pub use state::{SessionLimitConfig, SessionState, SessionStatus, TIMESTAMP_RETENTION};
pub use tracker::{SessionDecision, SessionTracker};
