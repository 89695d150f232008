//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the
//! application layer needs. Infrastructure adapters implement these ports.

use crate::domain::key::RateLimitKey;
use crate::domain::policy::Policy;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Port for obtaining current time.
///
/// Allows the application layer to work with time without depending on the
/// system clock. `now()` must be monotonic within a process. Infrastructure
/// provides `MonotonicClock` for production and `MockClock` for tests.
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Port for concurrent per-key storage.
///
/// Implementations must serialize mutation per key (the closure passed to
/// [`Storage::with_entry_mut`] runs under the entry's lock) while keeping
/// operations on distinct keys free of contention.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// The factory runs only when the key is absent; the accessor runs under
    /// the per-key lock.
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Access an existing entry mutably without creating it.
    fn with_existing_mut<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R;

    /// Remove an entry, returning whether it existed.
    fn remove(&self, key: &K) -> bool;

    /// Visit every entry.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V);

    /// Number of entries currently tracked.
    fn len(&self) -> usize;

    /// Whether the storage is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries.
    fn clear(&self);

    /// Keep only entries for which the predicate returns true.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

/// Typed failure of the shared quota store.
///
/// Store failures are never surfaced to `check` callers; the engine absorbs
/// them into degraded decisions per the configured fallback mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or answered with a transport error.
    Unavailable(String),
    /// The caller's deadline expired before the store responded.
    DeadlineExceeded,
    /// The store answered but the operation itself failed.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(detail) => write!(f, "quota store unavailable: {detail}"),
            StoreError::DeadlineExceeded => write!(f, "quota store call exceeded deadline"),
            StoreError::Backend(detail) => write!(f, "quota store backend error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of an atomic check-and-consume against the shared store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    /// Whether `cost` was admitted.
    pub allowed: bool,
    /// Tokens remaining in the authoritative store after the call (after
    /// both the cost and any lease grant were deducted).
    pub remaining: f64,
    /// Hint for when a retry could succeed, computed on the store's clock.
    pub retry_after: Option<Duration>,
    /// Lease tokens granted to the caller, `<= lease_request`. Already
    /// deducted from `remaining`, so outstanding leases plus the store
    /// remainder never exceed global capacity.
    pub granted: f64,
}

/// Port for the shared quota store (the synchronization layer).
///
/// The central correctness requirement lives here: check-and-consume must be
/// indivisible, so two callers racing on the same key can never both win the
/// last token. Refill arithmetic uses the store's own clock; client clocks
/// cannot be used to game quota.
///
/// Implementations decide their consistency strength (a strongly consistent
/// script vs. a best-effort replicated counter); the engine only requires
/// the atomicity of each individual call.
pub trait QuotaStore: Send + Sync {
    /// Atomically consume `cost` for `key`, granting up to `lease_request`
    /// additional tokens as a local lease when the consume succeeds.
    fn atomic_consume(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> impl Future<Output = Result<ConsumeOutcome, StoreError>> + Send;

    /// Health check with the same transport as `atomic_consume`.
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(
            StoreError::DeadlineExceeded.to_string(),
            "quota store call exceeded deadline"
        );
    }
}
