//! Domain layer - pure accounting logic with no external dependencies.
//!
//! This layer contains the core concepts and invariants of admission control:
//! - Rate limit keys
//! - Quota policies and their validation
//! - The four accounting algorithms behind one `Limiter` capability
//! - Admission decisions
//!
//! All types in this layer are pure and easily testable.

pub mod bucket;
pub mod decision;
pub mod key;
pub mod policy;
