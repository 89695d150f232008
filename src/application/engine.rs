//! The admission decision engine.
//!
//! Orchestrates policy resolution, the local lease fast path, the shared
//! store and the fallback governor to answer allow/deny for a (key, cost)
//! pair. The engine always answers; every runtime failure is absorbed into a
//! `Decision { degraded: true }` according to the configured fallback mode.

use crate::application::fallback::{FallbackMode, OutageConfig, OutageGovernor};
use crate::application::lease::{Lease, LeaseCache};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, QuotaStore, Storage, StoreError};
use crate::application::registry::{PolicyRegistry, ResolvedPolicy};
use crate::domain::decision::{Decision, DenyReason};
use crate::domain::key::RateLimitKey;
use crate::domain::policy::{Policy, PolicyError};
use crate::infrastructure::clock::MonotonicClock;
use crate::infrastructure::storage::ShardedStorage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Error raised when the engine builder is misconfigured.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
    /// The default policy failed validation.
    Policy(PolicyError),
    /// Lease fraction must lie in [0, 1].
    InvalidLeaseFraction(f64),
    /// Lease TTL must be non-zero.
    ZeroLeaseTtl,
    /// Store timeout must be non-zero.
    ZeroStoreTimeout,
    /// The lease cache must be allowed to track at least one key.
    ZeroMaxCachedKeys,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Policy(e) => write!(f, "invalid default policy: {e}"),
            BuildError::InvalidLeaseFraction(v) => {
                write!(f, "lease fraction must be within [0, 1], got {v}")
            }
            BuildError::ZeroLeaseTtl => write!(f, "lease TTL must be greater than zero"),
            BuildError::ZeroStoreTimeout => write!(f, "store timeout must be greater than zero"),
            BuildError::ZeroMaxCachedKeys => {
                write!(f, "lease cache must track at least one key")
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl From<PolicyError> for BuildError {
    fn from(e: PolicyError) -> Self {
        BuildError::Policy(e)
    }
}

/// Admission control engine coordinating local leases with a shared store.
///
/// # Examples
///
/// ```no_run
/// use quota_gate::{AdmissionEngine, InMemoryQuotaStore, Policy, RateLimitKey};
///
/// # async fn demo() {
/// let engine = AdmissionEngine::builder(
///     InMemoryQuotaStore::new(),
///     Policy::token_bucket(100, 10.0).unwrap(),
/// )
/// .build()
/// .unwrap();
///
/// let decision = engine.check(&RateLimitKey::new("tenant-1:api"), 1.0).await;
/// if !decision.allowed {
///     // honor decision.retry_after before retrying
/// }
/// # }
/// ```
pub struct AdmissionEngine<Q, S = ShardedStorage<RateLimitKey, Lease>>
where
    Q: QuotaStore,
    S: Storage<RateLimitKey, Lease>,
{
    registry: Arc<PolicyRegistry>,
    store: Q,
    leases: LeaseCache<S>,
    governor: OutageGovernor,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    fallback: FallbackMode,
    lease_fraction: f64,
    lease_ttl: Duration,
    store_timeout: Duration,
}

impl<Q> AdmissionEngine<Q>
where
    Q: QuotaStore,
{
    /// Start building an engine around a store and a global default policy.
    pub fn builder(store: Q, default_policy: Policy) -> AdmissionEngineBuilder<Q> {
        AdmissionEngineBuilder {
            store,
            default_policy,
            lease_storage: ShardedStorage::new(),
            clock: None,
            fallback: FallbackMode::FailClosed,
            outage: OutageConfig::default(),
            lease_fraction: 0.1,
            lease_ttl: Duration::from_secs(1),
            store_timeout: Duration::from_millis(100),
            max_cached_keys: 100_000,
        }
    }
}

impl<Q, S> AdmissionEngine<Q, S>
where
    Q: QuotaStore,
    S: Storage<RateLimitKey, Lease>,
{
    /// Decide whether to admit `cost` for `key`, bounding any store call by
    /// the engine's configured timeout.
    pub async fn check(&self, key: &RateLimitKey, cost: f64) -> Decision {
        let deadline = self.clock.now() + self.store_timeout;
        self.check_with_deadline(key, cost, deadline).await
    }

    /// Decide whether to admit `cost` for `key` with a caller-supplied
    /// deadline.
    ///
    /// The deadline bounds tail latency: if the store has not answered by
    /// then, the fallback mode applies immediately. The local fast path never
    /// waits on I/O at all.
    pub async fn check_with_deadline(
        &self,
        key: &RateLimitKey,
        cost: f64,
        deadline: Instant,
    ) -> Decision {
        let resolved = self.registry.resolve(key);
        let now = self.clock.now();

        // Invalid costs are rejected before any state is touched.
        if !resolved.policy.admits_cost(cost) {
            let remaining = self.leases.peek_remaining(key, resolved.version, now);
            let decision = Decision::deny(remaining, None, DenyReason::InvalidCost);
            self.metrics.record(&resolved.pattern, &decision);
            return decision;
        }

        // Common path: spend the local lease, no network.
        if let Some(hit) = self.leases.try_local(key, cost, resolved.version, now) {
            let decision = Decision::allow(hit.remaining);
            self.metrics.record(&resolved.pattern, &decision);
            return decision;
        }

        let decision = if self.governor.should_attempt_store(now) {
            self.consult_store(key, cost, &resolved, deadline).await
        } else {
            self.fallback_decision(key, cost)
        };

        self.metrics.record(&resolved.pattern, &decision);
        decision
    }

    async fn consult_store(
        &self,
        key: &RateLimitKey,
        cost: f64,
        resolved: &ResolvedPolicy,
        deadline: Instant,
    ) -> Decision {
        let now = self.clock.now();
        let budget = deadline.saturating_duration_since(now);

        // An already-expired deadline says nothing about store health, so
        // apply the fallback without charging the governor a failure.
        if budget.is_zero() {
            warn!(key = %key, "deadline expired before store call, applying fallback");
            return self.fallback_decision(key, cost);
        }

        let lease_request = resolved.policy.capacity_f64() * self.lease_fraction;
        let call = self
            .store
            .atomic_consume(key, cost, lease_request, &resolved.policy);
        let result = match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::DeadlineExceeded),
        };

        match result {
            Ok(outcome) => {
                self.governor.record_success();
                let now = self.clock.now();

                if outcome.allowed && outcome.granted > 0.0 {
                    trace!(key = %key, granted = outcome.granted, "installing quota lease");
                    self.leases.install(
                        key,
                        Lease {
                            granted: outcome.granted,
                            local_remaining: outcome.granted,
                            store_remaining: outcome.remaining,
                            expires_at: now + self.lease_ttl,
                            policy_version: resolved.version,
                        },
                        now,
                    );
                }

                // Estimate: authoritative remainder plus whatever this
                // process still holds locally.
                let local = self.leases.local_tokens(key, resolved.version, now);
                if outcome.allowed {
                    Decision::allow(outcome.remaining + local)
                } else {
                    Decision::deny(
                        outcome.remaining + local,
                        outcome.retry_after,
                        DenyReason::QuotaExhausted,
                    )
                }
            }
            Err(err) => {
                self.governor.record_failure(self.clock.now());
                warn!(key = %key, error = %err, "quota store unreachable, applying fallback");
                self.fallback_decision(key, cost)
            }
        }
    }

    fn fallback_decision(&self, key: &RateLimitKey, cost: f64) -> Decision {
        match self.fallback {
            FallbackMode::FailClosed => {
                Decision::deny(0.0, None, DenyReason::StoreUnavailable).degraded()
            }
            FallbackMode::FailOpen {
                local_burst_allowance,
            } => {
                if self.governor.try_burst_admit(key, cost, local_burst_allowance) {
                    Decision::allow(self.governor.burst_remaining(key, local_burst_allowance))
                        .degraded()
                } else {
                    Decision::deny(0.0, None, DenyReason::StoreUnavailable).degraded()
                }
            }
        }
    }

    /// Drop the local lease for a key, forcing the next check to the store.
    pub fn release(&self, key: &RateLimitKey) -> bool {
        self.leases.release(key)
    }

    /// The policy registry backing this engine (admin surface:
    /// `get_policy` / `set_policy`).
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Admission metrics for this engine.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The shared store this engine coordinates through.
    pub fn store(&self) -> &Q {
        &self.store
    }

    /// Health-check the shared store.
    pub async fn ping_store(&self) -> Result<(), StoreError> {
        match tokio::time::timeout(self.store_timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::DeadlineExceeded),
        }
    }
}

/// Builder for [`AdmissionEngine`]; see [`AdmissionEngine::builder`].
pub struct AdmissionEngineBuilder<Q, S = ShardedStorage<RateLimitKey, Lease>>
where
    Q: QuotaStore,
    S: Storage<RateLimitKey, Lease>,
{
    store: Q,
    default_policy: Policy,
    lease_storage: S,
    clock: Option<Arc<dyn Clock>>,
    fallback: FallbackMode,
    outage: OutageConfig,
    lease_fraction: f64,
    lease_ttl: Duration,
    store_timeout: Duration,
    max_cached_keys: usize,
}

impl<Q, S> AdmissionEngineBuilder<Q, S>
where
    Q: QuotaStore,
    S: Storage<RateLimitKey, Lease>,
{
    /// Use a custom clock (tests inject `MockClock` here).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fallback behavior when the store is unreachable. Defaults to
    /// fail-closed, protecting the downstream resource.
    pub fn with_fallback(mut self, fallback: FallbackMode) -> Self {
        self.fallback = fallback;
        self
    }

    /// Thresholds for declaring the store down and probing recovery.
    pub fn with_outage_config(mut self, outage: OutageConfig) -> Self {
        self.outage = outage;
        self
    }

    /// Fraction of policy capacity requested as a local lease on each store
    /// round-trip (default 0.1). Zero disables leasing entirely: every check
    /// goes to the store.
    pub fn with_lease_fraction(mut self, fraction: f64) -> Self {
        self.lease_fraction = fraction;
        self
    }

    /// How long a granted lease may be spent locally (default 1s).
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Default per-call budget for store round-trips (default 100ms);
    /// `check_with_deadline` overrides it per call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Cap on keys tracked by the lease cache (default 100_000).
    pub fn with_max_cached_keys(mut self, max: usize) -> Self {
        self.max_cached_keys = max;
        self
    }

    /// Swap the lease cache storage implementation.
    pub fn with_lease_storage<S2>(self, storage: S2) -> AdmissionEngineBuilder<Q, S2>
    where
        S2: Storage<RateLimitKey, Lease>,
    {
        AdmissionEngineBuilder {
            store: self.store,
            default_policy: self.default_policy,
            lease_storage: storage,
            clock: self.clock,
            fallback: self.fallback,
            outage: self.outage,
            lease_fraction: self.lease_fraction,
            lease_ttl: self.lease_ttl,
            store_timeout: self.store_timeout,
            max_cached_keys: self.max_cached_keys,
        }
    }

    /// Validate the configuration and build the engine.
    pub fn build(self) -> Result<AdmissionEngine<Q, S>, BuildError> {
        if !(0.0..=1.0).contains(&self.lease_fraction) || !self.lease_fraction.is_finite() {
            return Err(BuildError::InvalidLeaseFraction(self.lease_fraction));
        }
        if self.lease_ttl.is_zero() {
            return Err(BuildError::ZeroLeaseTtl);
        }
        if self.store_timeout.is_zero() {
            return Err(BuildError::ZeroStoreTimeout);
        }
        if self.max_cached_keys == 0 {
            return Err(BuildError::ZeroMaxCachedKeys);
        }

        let registry = Arc::new(PolicyRegistry::new(self.default_policy)?);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let governor = OutageGovernor::new(self.outage, clock.now());

        Ok(AdmissionEngine {
            registry,
            store: self.store,
            leases: LeaseCache::new(self.lease_storage, self.max_cached_keys),
            governor,
            metrics: Metrics::new(),
            clock,
            fallback: self.fallback,
            lease_fraction: self.lease_fraction,
            lease_ttl: self.lease_ttl,
            store_timeout: self.store_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validation() {
        fn build(f: impl FnOnce(AdmissionEngineBuilder<crate::infrastructure::memory_store::InMemoryQuotaStore>) -> AdmissionEngineBuilder<crate::infrastructure::memory_store::InMemoryQuotaStore>) -> Result<(), BuildError> {
            let builder = AdmissionEngine::builder(
                crate::infrastructure::memory_store::InMemoryQuotaStore::new(),
                Policy::token_bucket(10, 1.0).unwrap(),
            );
            f(builder).build().map(|_| ())
        }

        assert!(build(|b| b).is_ok());
        assert!(matches!(
            build(|b| b.with_lease_fraction(1.5)),
            Err(BuildError::InvalidLeaseFraction(_))
        ));
        assert!(matches!(
            build(|b| b.with_lease_ttl(Duration::ZERO)),
            Err(BuildError::ZeroLeaseTtl)
        ));
        assert!(matches!(
            build(|b| b.with_store_timeout(Duration::ZERO)),
            Err(BuildError::ZeroStoreTimeout)
        ));
        assert!(matches!(
            build(|b| b.with_max_cached_keys(0)),
            Err(BuildError::ZeroMaxCachedKeys)
        ));
    }

    #[test]
    fn test_invalid_default_policy_fails_build() {
        let result = AdmissionEngine::builder(
            crate::infrastructure::memory_store::InMemoryQuotaStore::new(),
            Policy {
                capacity: 0,
                refill_per_second: 1.0,
                algorithm: crate::domain::policy::Algorithm::TokenBucket,
                window: Duration::ZERO,
            },
        )
        .build();
        assert!(matches!(result, Err(BuildError::Policy(_))));
    }
}
