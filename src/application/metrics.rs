//! Observability metrics for admission control.
//!
//! Counters and gauges are updated with atomic operations on every decision
//! and exposed through snapshots for an external metrics system to scrape;
//! this crate does not ship an exporter.

use crate::domain::decision::Decision;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking admission statistics, crate-wide and per key-pattern.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    admitted_total: AtomicU64,
    denied_total: AtomicU64,
    degraded_total: AtomicU64,
    per_pattern: DashMap<Arc<str>, PatternCounters, ahash::RandomState>,
}

#[derive(Debug, Default)]
struct PatternCounters {
    admitted: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
    /// Latest estimated remaining tokens, stored as f64 bits.
    estimated_tokens: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                admitted_total: AtomicU64::new(0),
                denied_total: AtomicU64::new(0),
                degraded_total: AtomicU64::new(0),
                per_pattern: DashMap::with_hasher(ahash::RandomState::new()),
            }),
        }
    }

    /// Record a decision against the pattern that resolved its policy.
    pub(crate) fn record(&self, pattern: &Arc<str>, decision: &Decision) {
        if decision.allowed {
            self.inner.admitted_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.denied_total.fetch_add(1, Ordering::Relaxed);
        }
        if decision.degraded {
            self.inner.degraded_total.fetch_add(1, Ordering::Relaxed);
        }

        let counters = self
            .inner
            .per_pattern
            .entry(Arc::clone(pattern))
            .or_default();
        if decision.allowed {
            counters.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        if decision.degraded {
            counters.degraded.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .estimated_tokens
            .store(decision.remaining.to_bits(), Ordering::Relaxed);
    }

    /// Total admitted requests.
    pub fn admitted_total(&self) -> u64 {
        self.inner.admitted_total.load(Ordering::Relaxed)
    }

    /// Total denied requests.
    pub fn denied_total(&self) -> u64 {
        self.inner.denied_total.load(Ordering::Relaxed)
    }

    /// Total decisions made without the shared store.
    pub fn degraded_total(&self) -> u64 {
        self.inner.degraded_total.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot of the crate-wide counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted_total: self.admitted_total(),
            denied_total: self.denied_total(),
            degraded_total: self.degraded_total(),
        }
    }

    /// Snapshot for a single key-pattern, if it has seen traffic.
    pub fn pattern_snapshot(&self, pattern: &str) -> Option<PatternSnapshot> {
        self.inner.per_pattern.get(pattern).map(|c| PatternSnapshot {
            admitted: c.admitted.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
            estimated_tokens: f64::from_bits(c.estimated_tokens.load(Ordering::Relaxed)),
        })
    }

    /// Reset all counters and gauges.
    pub fn reset(&self) {
        self.inner.admitted_total.store(0, Ordering::Relaxed);
        self.inner.denied_total.store(0, Ordering::Relaxed);
        self.inner.degraded_total.store(0, Ordering::Relaxed);
        self.inner.per_pattern.clear();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of the crate-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total admitted requests.
    pub admitted_total: u64,
    /// Total denied requests.
    pub denied_total: u64,
    /// Total degraded (store-less) decisions.
    pub degraded_total: u64,
}

impl MetricsSnapshot {
    /// Total decisions made.
    pub fn total(&self) -> u64 {
        self.admitted_total.saturating_add(self.denied_total)
    }

    /// Ratio of denied decisions, 0.0 when idle.
    pub fn denial_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.denied_total as f64 / total as f64
        }
    }
}

/// Per-pattern counters plus the estimated-tokens gauge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternSnapshot {
    pub admitted: u64,
    pub denied: u64,
    pub degraded: u64,
    /// Latest observed estimate of remaining tokens for keys under this
    /// pattern.
    pub estimated_tokens: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::DenyReason;

    fn pattern(p: &str) -> Arc<str> {
        Arc::from(p)
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        let p = pattern("api:*");

        metrics.record(&p, &Decision::allow(9.0));
        metrics.record(&p, &Decision::allow(8.0));
        metrics.record(&p, &Decision::deny(8.0, None, DenyReason::QuotaExhausted));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.admitted_total, 2);
        assert_eq!(snapshot.denied_total, 1);
        assert_eq!(snapshot.degraded_total, 0);
        assert!((snapshot.denial_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_counted_on_both_outcomes() {
        let metrics = Metrics::new();
        let p = pattern("default");

        metrics.record(&p, &Decision::allow(1.0).degraded());
        metrics.record(
            &p,
            &Decision::deny(0.0, None, DenyReason::StoreUnavailable).degraded(),
        );

        assert_eq!(metrics.degraded_total(), 2);
        assert_eq!(metrics.admitted_total(), 1);
        assert_eq!(metrics.denied_total(), 1);
    }

    #[test]
    fn test_pattern_breakdown_and_gauge() {
        let metrics = Metrics::new();
        let a = pattern("tenant:*");
        let b = pattern("default");

        metrics.record(&a, &Decision::allow(42.5));
        metrics.record(&b, &Decision::deny(0.0, None, DenyReason::QuotaExhausted));

        let snap_a = metrics.pattern_snapshot("tenant:*").unwrap();
        assert_eq!(snap_a.admitted, 1);
        assert_eq!(snap_a.denied, 0);
        assert!((snap_a.estimated_tokens - 42.5).abs() < 1e-9);

        let snap_b = metrics.pattern_snapshot("default").unwrap();
        assert_eq!(snap_b.denied, 1);
        assert!(metrics.pattern_snapshot("missing").is_none());
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        let p = pattern("x");
        metrics.record(&p, &Decision::allow(1.0));
        metrics.reset();

        assert_eq!(metrics.snapshot().total(), 0);
        assert!(metrics.pattern_snapshot("x").is_none());
    }
}
