//! Mock implementations for testing.
//!
//! Available to downstream crates through the `test-helpers` feature.

mod clock;
mod store;

pub use clock::MockClock;
pub use store::MockQuotaStore;
