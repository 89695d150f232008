//! Fallback behavior while the shared quota store is unreachable.
//!
//! The engine never answers "I don't know": when the store is down it keeps
//! deciding per the configured [`FallbackMode`], and the [`OutageGovernor`]
//! tracks store health so a hard outage short-circuits store calls instead
//! of paying the timeout on every request.

use crate::domain::key::RateLimitKey;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

const COST_EPSILON: f64 = 1e-9;

/// What to answer when the store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Admit, but meter each key through a local zero-refill bucket of
    /// `local_burst_allowance` tokens so a prolonged outage cannot admit
    /// unbounded traffic beyond the last authoritative state.
    FailOpen { local_burst_allowance: f64 },
    /// Deny, protecting the downstream resource over caller availability.
    FailClosed,
}

/// Store health as tracked by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    /// Store answering normally.
    Healthy = 0,
    /// Store considered down; calls are skipped until the retry timeout.
    Down = 1,
    /// Retry timeout elapsed; calls go through again to probe recovery.
    Probing = 2,
}

impl From<u8> for StoreHealth {
    fn from(value: u8) -> Self {
        match value {
            1 => StoreHealth::Down,
            2 => StoreHealth::Probing,
            _ => StoreHealth::Healthy,
        }
    }
}

/// Thresholds for declaring the store down and probing recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutageConfig {
    /// Consecutive failures before skipping store calls.
    pub failure_threshold: u32,
    /// How long to skip before probing again.
    pub retry_timeout: Duration,
}

impl Default for OutageConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            retry_timeout: Duration::from_secs(5),
        }
    }
}

/// Tracks store health and meters fail-open admissions.
///
/// Health transitions use atomics only; the per-key burst buckets live in a
/// sharded map created lazily at outage onset and dropped on recovery.
#[derive(Debug)]
pub struct OutageGovernor {
    health: AtomicU8,
    consecutive_failures: AtomicU64,
    /// Nanoseconds since `epoch` of the most recent failure.
    last_failure_nanos: AtomicU64,
    epoch: Instant,
    config: OutageConfig,
    /// Remaining fail-open budget per key for the current outage.
    burst_budgets: DashMap<RateLimitKey, f64, ahash::RandomState>,
}

impl OutageGovernor {
    /// Create a governor with the given thresholds, anchored at `now`.
    pub fn new(config: OutageConfig, now: Instant) -> Self {
        Self {
            health: AtomicU8::new(StoreHealth::Healthy as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_nanos: AtomicU64::new(0),
            epoch: now,
            config,
            burst_budgets: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Current health.
    pub fn health(&self) -> StoreHealth {
        StoreHealth::from(self.health.load(Ordering::Acquire))
    }

    /// Whether the engine should attempt a store call right now.
    ///
    /// While down, a single caller flips the state to probing once the retry
    /// timeout elapses (compare-exchange keeps the transition unique), and
    /// probing traffic flows to the store until the verdict comes back.
    pub fn should_attempt_store(&self, now: Instant) -> bool {
        match self.health() {
            StoreHealth::Healthy | StoreHealth::Probing => true,
            StoreHealth::Down => {
                let since_failure = now
                    .saturating_duration_since(self.epoch)
                    .saturating_sub(Duration::from_nanos(
                        self.last_failure_nanos.load(Ordering::Acquire),
                    ));
                if since_failure >= self.config.retry_timeout {
                    let flipped = self.health.compare_exchange(
                        StoreHealth::Down as u8,
                        StoreHealth::Probing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    flipped.is_ok() || self.health() == StoreHealth::Probing
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful store call: back to healthy, outage budgets gone.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let previous = self
            .health
            .swap(StoreHealth::Healthy as u8, Ordering::AcqRel);
        if previous != StoreHealth::Healthy as u8 {
            self.burst_budgets.clear();
        }
    }

    /// Record a failed store call at `now`.
    pub fn record_failure(&self, now: Instant) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_nanos.store(
            now.saturating_duration_since(self.epoch).as_nanos() as u64,
            Ordering::Release,
        );

        let health = self.health();
        if health == StoreHealth::Probing || failures >= u64::from(self.config.failure_threshold) {
            self.health.store(StoreHealth::Down as u8, Ordering::Release);
        }
    }

    /// Spend `cost` from the key's fail-open budget.
    ///
    /// The budget is a zero-refill bucket of `allowance` tokens created at
    /// first use during an outage; once drained, fail-open denies until the
    /// store recovers.
    pub fn try_burst_admit(&self, key: &RateLimitKey, cost: f64, allowance: f64) -> bool {
        let mut budget = self
            .burst_budgets
            .entry(key.clone())
            .or_insert(allowance);
        if *budget + COST_EPSILON >= cost {
            *budget -= cost;
            true
        } else {
            false
        }
    }

    /// Remaining fail-open budget for a key (full allowance when untouched).
    pub fn burst_remaining(&self, key: &RateLimitKey, allowance: f64) -> f64 {
        self.burst_budgets
            .get(key)
            .map(|budget| *budget)
            .unwrap_or(allowance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(threshold: u32, retry: Duration) -> OutageGovernor {
        OutageGovernor::new(
            OutageConfig {
                failure_threshold: threshold,
                retry_timeout: retry,
            },
            Instant::now(),
        )
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let gov = governor(3, Duration::from_secs(5));
        let now = Instant::now();

        gov.record_failure(now);
        gov.record_failure(now);
        assert_eq!(gov.health(), StoreHealth::Healthy);
        assert!(gov.should_attempt_store(now));

        gov.record_failure(now);
        assert_eq!(gov.health(), StoreHealth::Down);
        assert!(!gov.should_attempt_store(now));
    }

    #[test]
    fn test_probes_after_retry_timeout() {
        let gov = governor(1, Duration::from_secs(5));
        let now = Instant::now();
        gov.record_failure(now);
        assert_eq!(gov.health(), StoreHealth::Down);

        // Before the timeout: still skipping
        assert!(!gov.should_attempt_store(now + Duration::from_secs(4)));

        // After: one probe flips to Probing, further attempts also flow
        let later = now + Duration::from_secs(6);
        assert!(gov.should_attempt_store(later));
        assert_eq!(gov.health(), StoreHealth::Probing);
        assert!(gov.should_attempt_store(later));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let gov = governor(1, Duration::from_millis(10));
        let now = Instant::now();
        gov.record_failure(now);

        let probe_at = now + Duration::from_millis(20);
        assert!(gov.should_attempt_store(probe_at));
        gov.record_failure(probe_at);
        assert_eq!(gov.health(), StoreHealth::Down);
        assert!(!gov.should_attempt_store(probe_at));
    }

    #[test]
    fn test_success_recovers_and_clears_budgets() {
        let gov = governor(1, Duration::from_secs(5));
        let now = Instant::now();
        let key = RateLimitKey::new("k");

        gov.record_failure(now);
        assert!(gov.try_burst_admit(&key, 3.0, 5.0));
        assert!((gov.burst_remaining(&key, 5.0) - 2.0).abs() < 1e-9);

        gov.record_success();
        assert_eq!(gov.health(), StoreHealth::Healthy);
        // Fresh outage, fresh budget
        assert!((gov.burst_remaining(&key, 5.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_burst_budget_is_bounded() {
        let gov = governor(1, Duration::from_secs(5));
        let key = RateLimitKey::new("k");

        let mut admitted = 0;
        for _ in 0..20 {
            if gov.try_burst_admit(&key, 1.0, 5.0) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        // Distinct keys have independent budgets
        assert!(gov.try_burst_admit(&RateLimitKey::new("other"), 5.0, 5.0));
    }

    #[test]
    fn test_concurrent_burst_never_exceeds_allowance() {
        use std::sync::Arc;
        use std::thread;

        let gov = Arc::new(governor(1, Duration::from_secs(5)));
        let key = RateLimitKey::new("k");
        let mut handles = vec![];

        for _ in 0..8 {
            let gov = Arc::clone(&gov);
            let key = key.clone();
            handles.push(thread::spawn(move || {
                (0..25)
                    .filter(|_| gov.try_burst_admit(&key, 1.0, 100.0))
                    .count()
            }));
        }

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
