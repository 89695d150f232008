//! Deterministic clock for tests.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A [`Clock`] whose time only moves when the test says so.
///
/// Clones share the same underlying instant, so a test hands one clone to
/// the engine or store under test and keeps another to drive refill and
/// window arithmetic:
///
/// ```
/// use quota_gate::infrastructure::mocks::MockClock;
/// use quota_gate::Clock;
/// use std::time::{Duration, Instant};
///
/// let clock = MockClock::new(Instant::now());
/// let before = clock.now();
/// clock.advance(Duration::from_secs(30));
/// assert_eq!(clock.now(), before + Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    instant: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// A clock frozen at `start` until told otherwise.
    pub fn new(start: Instant) -> Self {
        Self {
            instant: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward by `step`. States under test observe the jump on
    /// their next `now()` read.
    pub fn advance(&self, step: Duration) {
        *self.locked() += step;
    }

    /// Jump to an absolute instant. Backward jumps are permitted; the
    /// accounting states clamp them, and tests use `set` to exercise that.
    pub fn set(&self, to: Instant) {
        *self.locked() = to;
    }

    fn locked(&self) -> MutexGuard<'_, Instant> {
        self.instant
            .lock()
            .expect("mock clock poisoned by a panicked test thread")
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_one_timeline() {
        let clock = MockClock::new(Instant::now());
        let handle = clock.clone();

        clock.advance(Duration::from_secs(5));
        assert_eq!(handle.now(), clock.now());

        handle.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), handle.now());
    }

    #[test]
    fn test_set_can_move_backwards() {
        let start = Instant::now();
        let clock = MockClock::new(start + Duration::from_secs(60));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
