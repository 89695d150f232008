//! Clock adapters for time operations.
//!
//! `MonotonicClock` is the production implementation. See `MockClock` (in
//! `crate::infrastructure::mocks`) for a controllable test clock, available
//! with the `test-helpers` feature or in test builds.

use crate::application::ports::Clock;
use std::time::Instant;

/// Monotonic clock backed by `Instant::now()`.
///
/// `Instant` never goes backward within a process, which is the guarantee
/// local refill arithmetic relies on. Authoritative cross-node refill uses
/// the store's own clock, not this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Create a new monotonic clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
