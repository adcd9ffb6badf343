//! Wall-clock abstraction.
//!
//! Every time-dependent component takes an `Arc<dyn Clock>` so tests can drive
//! time explicitly with [`MockClock`].

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, expressed as the offset from the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Duration;

    /// Current time in whole milliseconds since the epoch.
    fn now_millis(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// System clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A clock set before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Controllable clock for tests.
///
/// Clones share the same underlying time, so advancing one advances all.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a mock clock starting at `start` past the epoch.
    pub fn new(start: Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock at a fixed, round starting point.
    pub fn at_epoch_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.current.lock() = to;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now() > t1);
    }

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::at_epoch_secs(1_000);
        assert_eq!(clock.now_millis(), 1_000_000);

        let shared = clock.clone();
        shared.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Duration::from_millis(1_000_250));

        clock.set(Duration::from_secs(5));
        assert_eq!(shared.now(), Duration::from_secs(5));
    }
}
