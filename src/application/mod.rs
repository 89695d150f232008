//! Application layer - orchestration of the domain logic.
//!
//! This layer coordinates policy resolution, local leases, the shared store
//! and the fallback governor behind the admission engine.
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod engine;
pub mod fallback;
pub mod lease;
pub mod metrics;
pub mod ports;
pub mod registry;
