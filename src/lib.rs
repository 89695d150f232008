//! # quota-gate
//!
//! Distributed admission control for multi-tenant services.
//!
//! This crate answers one question on the hot path: may this request, with
//! this cost, proceed right now? Checks run against a shared quota store so
//! every instance of a service enforces the same budget, while a local lease
//! cache keeps the common case free of network round-trips.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quota_gate::{AdmissionEngine, InMemoryQuotaStore, Policy, RateLimitKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     // 100 burst capacity, refilling 10 tokens/sec
//!     let engine = AdmissionEngine::builder(
//!         InMemoryQuotaStore::new(),
//!         Policy::token_bucket(100, 10.0).unwrap(),
//!     )
//!     .build()
//!     .unwrap();
//!
//!     let key = RateLimitKey::composite("tenant-42", "/api/search");
//!     let decision = engine.check(&key, 1.0).await;
//!
//!     if decision.allowed {
//!         // proceed
//!     } else if let Some(wait) = decision.retry_after {
//!         // tell the caller to come back after `wait`
//!     }
//! }
//! ```
//!
//! ## Algorithms
//!
//! Each policy picks one of four interchangeable accounting algorithms:
//!
//! - **Token bucket**: burst up to capacity, smooth refill (recommended
//!   default)
//! - **Fixed window**: N units per window, hard reset at the boundary
//! - **Sliding window counter**: weighted blend of the current and previous
//!   window, smoothing the boundary burst
//! - **Sliding window log**: exact accounting of every admission timestamp,
//!   at the cost of remembering each in-window admission
//!
//! ```rust,no_run
//! # use quota_gate::Policy;
//! use std::time::Duration;
//!
//! let burst = Policy::token_bucket(100, 10.0).unwrap();
//! let per_minute = Policy::fixed_window(600, Duration::from_secs(60)).unwrap();
//! let smooth = Policy::sliding_window_counter(600, Duration::from_secs(60)).unwrap();
//! let exact = Policy::sliding_window_log(50, Duration::from_secs(1)).unwrap();
//! ```
//!
//! ## Per-Key Policies
//!
//! Policies are registered against key patterns and resolved most-specific
//! first: exact match, then longest matching `prefix*` wildcard, then the
//! global default. Registration is the only fallible surface; checks never
//! fail.
//!
//! ```rust,no_run
//! # use quota_gate::{AdmissionEngine, InMemoryQuotaStore, Policy};
//! # use std::time::Duration;
//! # let engine = AdmissionEngine::builder(
//! #     InMemoryQuotaStore::new(),
//! #     Policy::token_bucket(100, 10.0).unwrap(),
//! # ).build().unwrap();
//! engine
//!     .registry()
//!     .set_policy("tenant-42:*", Policy::token_bucket(1000, 100.0).unwrap())
//!     .unwrap();
//! engine
//!     .registry()
//!     .set_policy(
//!         "tenant-42:/api/export",
//!         Policy::fixed_window(10, Duration::from_secs(3600)).unwrap(),
//!     )
//!     .unwrap();
//! ```
//!
//! Policy updates take effect on the next check; leases granted under the
//! old policy are invalidated rather than spent.
//!
//! ## Leases
//!
//! Every successful store round-trip also reserves a small slice of the
//! remaining budget (10% of capacity by default) as a short-lived local
//! lease. Subsequent checks for the same key decrement the lease without
//! touching the network, so steady traffic costs one store call per lease
//! rather than one per request. Lease tokens are already deducted from the
//! shared budget, which keeps the global cap exact: the store can never be
//! oversubscribed, only underutilized for at most one lease TTL.
//!
//! ## Failure Handling
//!
//! The store being slow or down never turns into an error for callers. The
//! engine bounds each store call with a deadline and falls back per
//! [`FallbackMode`]:
//!
//! - `FailClosed` (default): deny while degraded
//! - `FailOpen { local_burst_allowance }`: admit while degraded, but meter
//!   each key through a local zero-refill budget so an outage cannot admit
//!   unbounded traffic
//!
//! Degraded decisions carry `degraded: true` so callers can observe the
//! mode. An outage governor skips store calls after repeated failures and
//! probes for recovery, so a hard outage does not pay the timeout on every
//! request.
//!
//! ```rust,no_run
//! # use quota_gate::{AdmissionEngine, FallbackMode, InMemoryQuotaStore, Policy};
//! let engine = AdmissionEngine::builder(
//!     InMemoryQuotaStore::new(),
//!     Policy::token_bucket(100, 10.0).unwrap(),
//! )
//! .with_fallback(FallbackMode::FailOpen {
//!     local_burst_allowance: 10.0,
//! })
//! .build()
//! .unwrap();
//! ```
//!
//! ## Observability
//!
//! ```rust,no_run
//! # use quota_gate::{AdmissionEngine, InMemoryQuotaStore, Policy};
//! # let engine = AdmissionEngine::builder(
//! #     InMemoryQuotaStore::new(),
//! #     Policy::token_bucket(100, 10.0).unwrap(),
//! # ).build().unwrap();
//! let snapshot = engine.metrics().snapshot();
//! println!("admitted: {}", snapshot.admitted_total);
//! println!("denied: {}", snapshot.denied_total);
//! println!("denial rate: {:.2}%", snapshot.denial_rate() * 100.0);
//! ```
//!
//! Internal store failures are reported through `tracing` warnings rather
//! than surfaced to callers.
//!
//! ## Distributed Deployments
//!
//! Enable the `redis-store` feature to share quota state across instances.
//! Accounting runs inside Redis as Lua scripts against the server's own
//! clock, so instances with skewed local clocks still agree on every
//! decision.
//!
//! ```toml
//! [dependencies]
//! quota-gate = { version = "*", features = ["redis-store"] }
//! ```

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    bucket::{Admission, Limiter, QuotaState},
    decision::{Decision, DenyReason},
    key::RateLimitKey,
    policy::{Algorithm, Policy, PolicyError},
};

pub use application::{
    engine::{AdmissionEngine, AdmissionEngineBuilder, BuildError},
    fallback::{FallbackMode, OutageConfig, StoreHealth},
    lease::Lease,
    metrics::{Metrics, MetricsSnapshot, PatternSnapshot},
    ports::{Clock, ConsumeOutcome, QuotaStore, Storage, StoreError},
    registry::{PolicyRegistry, ResolvedPolicy},
};

pub use infrastructure::{
    clock::MonotonicClock, memory_store::InMemoryQuotaStore, storage::ShardedStorage,
};

#[cfg(feature = "redis-store")]
pub use infrastructure::redis_store::{RedisQuotaStore, RedisStoreConfig};
