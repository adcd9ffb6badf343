//! Rate limiting logic and counter storage.

mod backend;
mod counter;
mod decision;
mod distributed;
mod key;
mod limiter;
mod memory;
mod rules;

pub use backend::{refill_and_take, BucketSpec, BucketState, CounterStore};
pub use counter::{TimeWindow, WindowStatus};
pub use decision::{DenyReason, RateLimitDecision};
pub use distributed::{RedisStore, RedisStoreConfig};
pub use key::{CounterKey, CounterScope};
pub use limiter::{RateLimiter, Strategy, BURST_WINDOW, DEFAULT_KEY_PREFIX};
pub use memory::MemoryStore;
pub use rules::{EndpointOverride, LimitSet, RateLimitRules, Tier, TierTable};

pub(crate) use counter::millis_to_datetime;
pub(crate) use decision::ceil_secs;
