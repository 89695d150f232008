//! Mock quota store for testing degraded paths.

use crate::application::ports::{Clock, ConsumeOutcome, QuotaStore, StoreError};
use crate::domain::key::RateLimitKey;
use crate::domain::policy::Policy;
use crate::infrastructure::memory_store::InMemoryQuotaStore;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory store wrapped with failure and latency injection.
///
/// While marked unavailable every call returns [`StoreError::Unavailable`]
/// without touching the inner accounting, so tests can verify that outage
/// handling neither consumes nor leaks quota.
#[derive(Debug)]
pub struct MockQuotaStore {
    inner: InMemoryQuotaStore,
    available: AtomicBool,
    delay: Mutex<Option<Duration>>,
    consume_calls: AtomicU64,
    ping_calls: AtomicU64,
}

impl MockQuotaStore {
    pub fn new() -> Self {
        Self::wrap(InMemoryQuotaStore::new())
    }

    /// Mock store whose inner accounting runs on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::wrap(InMemoryQuotaStore::with_clock(clock))
    }

    fn wrap(inner: InMemoryQuotaStore) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            delay: Mutex::new(None),
            consume_calls: AtomicU64::new(0),
            ping_calls: AtomicU64::new(0),
        }
    }

    /// Toggle availability. While unavailable, every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Inject latency into every call (e.g. to trip the engine's deadline).
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().expect("MockQuotaStore mutex poisoned") = delay;
    }

    /// Number of `atomic_consume` calls that reached this store.
    pub fn consume_calls(&self) -> u64 {
        self.consume_calls.load(Ordering::Acquire)
    }

    /// Number of `ping` calls that reached this store.
    pub fn ping_calls(&self) -> u64 {
        self.ping_calls.load(Ordering::Acquire)
    }

    /// Access the wrapped accounting store.
    pub fn inner(&self) -> &InMemoryQuotaStore {
        &self.inner
    }

    fn injected_delay(&self) -> Option<Duration> {
        *self.delay.lock().expect("MockQuotaStore mutex poisoned")
    }
}

impl Default for MockQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStore for MockQuotaStore {
    fn atomic_consume(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> impl Future<Output = Result<ConsumeOutcome, StoreError>> + Send {
        self.consume_calls.fetch_add(1, Ordering::AcqRel);
        let delay = self.injected_delay();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if !self.available.load(Ordering::Acquire) {
                return Err(StoreError::Unavailable("injected outage".into()));
            }
            self.inner.atomic_consume(key, cost, lease_request, policy).await
        }
    }

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.ping_calls.fetch_add(1, Ordering::AcqRel);
        let delay = self.injected_delay();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.available.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("injected outage".into()))
            }
        }
    }
}

impl QuotaStore for Arc<MockQuotaStore> {
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

    #[tokio::test]
    async fn test_outage_injection() {
        let store = MockQuotaStore::new();
        let key = RateLimitKey::new("k");
        let policy = Policy::token_bucket(5, 0.0).unwrap();

        assert!(store
            .atomic_consume(&key, 1.0, 0.0, &policy)
            .await
            .is_ok());

        store.set_available(false);
        let err = store
            .atomic_consume(&key, 1.0, 0.0, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.ping().await.is_err());

        // The failed call never touched the inner accounting
        assert!((store.inner().peek(&key, &policy) - 4.0).abs() < 1e-9);

        store.set_available(true);
        assert!(store.ping().await.is_ok());
        assert_eq!(store.consume_calls(), 2);
    }
}
