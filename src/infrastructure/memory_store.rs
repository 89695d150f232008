//! In-process quota store.
//!
//! A full [`QuotaStore`] implementation backed by the sharded map: the
//! entry lock makes each check-and-consume indivisible, so it satisfies the
//! same atomicity contract as a networked store. Suitable for
//! single-process deployments and as the deterministic backbone of tests.

use crate::application::ports::{Clock, ConsumeOutcome, QuotaStore, Storage, StoreError};
use crate::domain::bucket::{Limiter, QuotaState};
use crate::domain::key::RateLimitKey;
use crate::domain::policy::Policy;
use crate::infrastructure::clock::MonotonicClock;
use crate::infrastructure::storage::ShardedStorage;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug)]
struct KeyedQuota {
    /// Policy the state was built against; a different policy rebuilds it.
    policy: Policy,
    state: QuotaState,
}

/// Authoritative quota store living in this process.
///
/// The store owns its clock, mirroring the contract that refill arithmetic
/// runs on the store's time, never the caller's.
#[derive(Debug)]
pub struct InMemoryQuotaStore {
    entries: ShardedStorage<RateLimitKey, KeyedQuota>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQuotaStore {
    /// Store using the monotonic system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Store using a custom clock (tests inject `MockClock`).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: ShardedStorage::new(),
            clock,
        }
    }

    /// Estimate available tokens for a key without consuming.
    pub fn peek(&self, key: &RateLimitKey, policy: &Policy) -> f64 {
        let now = self.clock.now();
        self.entries
            .with_existing_mut(key, |entry| {
                if entry.policy == *policy {
                    entry.state.peek(policy, now)
                } else {
                    policy.capacity_f64()
                }
            })
            .unwrap_or_else(|| policy.capacity_f64())
    }

    /// Restore a key to full quota.
    pub fn reset(&self, key: &RateLimitKey) {
        self.entries.remove(key);
    }

    /// Drop all accounting state.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn consume_sync(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> ConsumeOutcome {
        let now = self.clock.now();
        self.entries.with_entry_mut(
            key.clone(),
            || KeyedQuota {
                policy: policy.clone(),
                state: QuotaState::new(policy, 0, now),
            },
            |entry| {
                if entry.policy != *policy {
                    // Hot-reloaded policy: rebuild accounting from scratch
                    entry.policy = policy.clone();
                    entry.state = QuotaState::new(policy, 0, now);
                }

                let admission = entry.state.try_consume(policy, cost, now);
                if !admission.allowed {
                    return ConsumeOutcome {
                        allowed: false,
                        remaining: admission.remaining,
                        retry_after: admission.retry_after,
                        granted: 0.0,
                    };
                }

                // Lease tokens are consumed here, under the same entry lock
                // as the cost, so outstanding leases are always accounted.
                let grant = lease_request.min(admission.remaining).max(0.0);
                let remaining = if grant > 0.0 {
                    entry.state.try_consume(policy, grant, now).remaining
                } else {
                    admission.remaining
                };

                ConsumeOutcome {
                    allowed: true,
                    remaining,
                    retry_after: None,
                    granted: grant,
                }
            },
        )
    }
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn atomic_consume(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> impl Future<Output = Result<ConsumeOutcome, StoreError>> + Send {
        let outcome = self.consume_sync(key, cost, lease_request, policy);
        async move { Ok(outcome) }
    }

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        async { Ok(()) }
    }
}

// Shared handles satisfy the port too, so one store can back many engines.
impl QuotaStore for Arc<InMemoryQuotaStore> {
    fn atomic_consume(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> impl Future<Output = Result<ConsumeOutcome, StoreError>> + Send {
        (**self).atomic_consume(key, cost, lease_request, policy)
    }

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::time::{Duration, Instant};

    #[test]
    fn test_consume_and_deny() {
        let store = InMemoryQuotaStore::new();
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(5, 0.0).unwrap();

        let outcome = store.consume_sync(&key, 2.0, 0.0, &policy);
        assert!(outcome.allowed);
        assert!((outcome.remaining - 3.0).abs() < 1e-9);

        let outcome = store.consume_sync(&key, 4.0, 0.0, &policy);
        assert!(!outcome.allowed);
        assert!((outcome.remaining - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_lease_grant_is_deducted_globally() {
        let store = InMemoryQuotaStore::new();
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(10, 0.0).unwrap();

        let outcome = store.consume_sync(&key, 1.0, 2.0, &policy);
        assert!(outcome.allowed);
        assert!((outcome.granted - 2.0).abs() < 1e-9);
        assert!((outcome.remaining - 7.0).abs() < 1e-9);
        assert!((store.peek(&key, &policy) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_lease_grant_clamped_to_remainder() {
        let store = InMemoryQuotaStore::new();
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(3, 0.0).unwrap();

        let outcome = store.consume_sync(&key, 2.0, 5.0, &policy);
        assert!(outcome.allowed);
        assert!((outcome.granted - 1.0).abs() < 1e-9);
        assert!(outcome.remaining.abs() < 1e-9);
    }

    #[test]
    fn test_denied_consume_grants_nothing() {
        let store = InMemoryQuotaStore::new();
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(2, 0.0).unwrap();

        assert!(store.consume_sync(&key, 2.0, 1.0, &policy).allowed);
        let denied = store.consume_sync(&key, 1.0, 1.0, &policy);
        assert!(!denied.allowed);
        assert!(denied.granted.abs() < 1e-9);
    }

    #[test]
    fn test_policy_change_rebuilds_state() {
        let store = InMemoryQuotaStore::new();
        let key = RateLimitKey::new("k");
        let small = Policy::token_bucket(2, 0.0).unwrap();
        let large = Policy::token_bucket(100, 0.0).unwrap();

        assert!(store.consume_sync(&key, 2.0, 0.0, &small).allowed);
        assert!(!store.consume_sync(&key, 1.0, 0.0, &small).allowed);

        // Fresh budget under the replacement policy
        let outcome = store.consume_sync(&key, 50.0, 0.0, &large);
        assert!(outcome.allowed);
        assert!((outcome.remaining - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_uses_store_clock() {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let store = InMemoryQuotaStore::with_clock(clock.clone());
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(10, 1.0).unwrap();

        assert!(store.consume_sync(&key, 10.0, 0.0, &policy).allowed);
        assert!(!store.consume_sync(&key, 1.0, 0.0, &policy).allowed);

        clock.advance(Duration::from_secs(10));
        assert!(store.consume_sync(&key, 10.0, 0.0, &policy).allowed);
    }

    #[test]
    fn test_race_freedom_exactly_capacity_admitted() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryQuotaStore::new());
        let key = RateLimitKey::new("contended");
        let policy = Policy::token_bucket(64, 0.0).unwrap();

        let mut handles = vec![];
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let key = key.clone();
            let policy = policy.clone();
            handles.push(thread::spawn(move || {
                (0..8)
                    .filter(|_| store.consume_sync(&key, 1.0, 0.0, &policy).allowed)
                    .count()
            }));
        }

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 16 threads x 8 attempts = 128 tries against capacity 64
        assert_eq!(admitted, 64);
    }

    #[tokio::test]
    async fn test_async_port_round_trip() {
        let store = InMemoryQuotaStore::new();
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(1, 0.0).unwrap();

        assert!(store.ping().await.is_ok());
        let outcome = store.atomic_consume(&key, 1.0, 0.0, &policy).await.unwrap();
        assert!(outcome.allowed);
        let outcome = store.atomic_consume(&key, 1.0, 0.0, &policy).await.unwrap();
        assert!(!outcome.allowed);
    }
}
