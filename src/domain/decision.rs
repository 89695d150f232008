//! Admission decisions returned to callers.

use std::time::Duration;

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Cost was non-positive or exceeded the policy capacity; no state was
    /// touched.
    InvalidCost,
    /// The key's quota is exhausted for now.
    QuotaExhausted,
    /// The shared store was unreachable and the fallback mode denied.
    StoreUnavailable,
}

/// Verdict of a single `check` call. Created fresh per call, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the cost was admitted.
    pub allowed: bool,
    /// Best estimate of tokens remaining for the key (authoritative store
    /// remainder plus any unexpired local lease).
    pub remaining: f64,
    /// Hint for when a retry with the same cost could succeed. `None` means
    /// waiting will not help or no hint is available.
    pub retry_after: Option<Duration>,
    /// True when the decision was made without the shared store (fallback
    /// path); the answer is still definitive, just locally governed.
    pub degraded: bool,
    /// Populated on denials.
    pub reason: Option<DenyReason>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
            degraded: false,
            reason: None,
        }
    }

    /// A denied request.
    pub fn deny(remaining: f64, retry_after: Option<Duration>, reason: DenyReason) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
            degraded: false,
            reason: Some(reason),
        }
    }

    /// Mark the decision as made under store unavailability.
    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    /// Suggested client backoff for a denial: jittered within
    /// `[retry_after, retry_after * attempt]` so herds of denied callers do
    /// not retry in lockstep. The lower bound is the `retry_after` hint
    /// itself, since retrying any earlier is guaranteed to be denied again.
    ///
    /// Returns `None` for allowed decisions and for denials with no hint.
    pub fn suggested_backoff(&self, attempt: u32) -> Option<Duration> {
        if self.allowed {
            return None;
        }
        let base = self.retry_after?;
        let scaled = base.saturating_mul(attempt.max(1));
        let jittered = scaled.as_secs_f64() * rand::random::<f64>();
        Some(Duration::from_secs_f64(jittered.max(base.as_secs_f64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_has_no_reason() {
        let d = Decision::allow(4.0);
        assert!(d.allowed);
        assert!(!d.degraded);
        assert_eq!(d.reason, None);
        assert_eq!(d.suggested_backoff(1), None);
    }

    #[test]
    fn test_degraded_marker() {
        let d = Decision::deny(0.0, None, DenyReason::StoreUnavailable).degraded();
        assert!(d.degraded);
        assert_eq!(d.reason, Some(DenyReason::StoreUnavailable));
    }

    #[test]
    fn test_suggested_backoff_bounds() {
        let d = Decision::deny(
            0.0,
            Some(Duration::from_secs(2)),
            DenyReason::QuotaExhausted,
        );
        for attempt in 1..5 {
            let backoff = d.suggested_backoff(attempt).unwrap();
            assert!(backoff >= Duration::from_secs(2));
            assert!(backoff <= Duration::from_secs(2) * attempt);
        }
    }

    #[test]
    fn test_no_hint_no_backoff() {
        let d = Decision::deny(1.0, None, DenyReason::QuotaExhausted);
        assert_eq!(d.suggested_backoff(3), None);
    }
}
