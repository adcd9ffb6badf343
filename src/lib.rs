//! Palisade - admission control and resilience primitives
//!
//! This crate protects a request-handling pipeline from overload and
//! cascading failure:
//!
//! - [`ratelimit`]: multi-window, multi-strategy rate limiting over an
//!   in-memory or Redis counter store
//! - [`session`]: per-session abuse tracking with progressive penalties
//! - [`breaker`]: circuit breakers for unreliable collaborators
//! - [`retry`]: retry with configurable backoff
//! - [`budget`]: hierarchical timeout budgets propagated through the call tree
//!
//! [`service::Palisade`] wires them together from a [`config::PalisadeConfig`].

pub mod breaker;
pub mod budget;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod retry;
pub mod service;
pub mod session;

pub use error::{PalisadeError, Result};
pub use service::Palisade;
