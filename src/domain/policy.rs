//! Quota policies describing how much traffic a key may admit.
//!
//! A [`Policy`] pairs a capacity with a refill model and selects one of four
//! accounting algorithms. Policies are validated once, at registration time;
//! a rejected registration is the only fatal error class in the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Accounting algorithm used for a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuous refill, bursts up to capacity. The default.
    TokenBucket,
    /// Counter reset at deterministic window boundaries. Cheapest, but admits
    /// up to 2x the nominal rate across a boundary; this is an accepted
    /// property of the algorithm, not a defect.
    FixedWindow,
    /// Weighted blend of the current and previous fixed window. Smooths the
    /// boundary burst without keeping a log.
    SlidingWindowCounter,
    /// Individual timestamped entries. Most accurate and most memory-hungry;
    /// intended for low-cardinality, high-precision keys.
    SlidingWindowLog,
}

impl Algorithm {
    /// Whether this algorithm accounts over an explicit window.
    pub fn is_windowed(&self) -> bool {
        !matches!(self, Algorithm::TokenBucket)
    }
}

/// Error raised when a policy fails validation at registration time.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// Capacity must be at least 1.
    ZeroCapacity,
    /// Refill rate must be finite and non-negative.
    InvalidRefillRate(f64),
    /// Window algorithms require a window strictly greater than zero.
    ZeroWindow,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::ZeroCapacity => write!(f, "policy capacity must be >= 1"),
            PolicyError::InvalidRefillRate(rate) => {
                write!(f, "refill rate must be finite and >= 0, got {rate}")
            }
            PolicyError::ZeroWindow => {
                write!(f, "window algorithms require a window > 0")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// A quota policy: capacity, refill model and algorithm selection.
///
/// # Examples
///
/// ```
/// use quota_gate::Policy;
/// use std::time::Duration;
///
/// // 100-token bucket refilling at 10 tokens/sec
/// let bucket = Policy::token_bucket(100, 10.0).unwrap();
///
/// // 1000 requests per minute, sliding-counter smoothed
/// let window = Policy::sliding_window_counter(1000, Duration::from_secs(60)).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum burst / per-window budget. Any single admissible cost must be
    /// at most this value.
    pub capacity: u64,
    /// Tokens regained per second (token bucket only; windows refill by
    /// expiry).
    pub refill_per_second: f64,
    /// Accounting algorithm.
    pub algorithm: Algorithm,
    /// Window length for the window algorithms. Ignored by the token bucket.
    #[serde(default)]
    pub window: Duration,
}

impl Policy {
    /// Token bucket with the given capacity and refill rate.
    pub fn token_bucket(capacity: u64, refill_per_second: f64) -> Result<Self, PolicyError> {
        Self {
            capacity,
            refill_per_second,
            algorithm: Algorithm::TokenBucket,
            window: Duration::ZERO,
        }
        .validated()
    }

    /// Fixed window admitting `capacity` cost per `window`.
    pub fn fixed_window(capacity: u64, window: Duration) -> Result<Self, PolicyError> {
        Self {
            capacity,
            refill_per_second: 0.0,
            algorithm: Algorithm::FixedWindow,
            window,
        }
        .validated()
    }

    /// Sliding window counter admitting `capacity` cost per `window`.
    pub fn sliding_window_counter(capacity: u64, window: Duration) -> Result<Self, PolicyError> {
        Self {
            capacity,
            refill_per_second: 0.0,
            algorithm: Algorithm::SlidingWindowCounter,
            window,
        }
        .validated()
    }

    /// Sliding window log admitting `capacity` cost per `window`.
    pub fn sliding_window_log(capacity: u64, window: Duration) -> Result<Self, PolicyError> {
        Self {
            capacity,
            refill_per_second: 0.0,
            algorithm: Algorithm::SlidingWindowLog,
            window,
        }
        .validated()
    }

    /// Validate the policy, consuming and returning it.
    pub fn validated(self) -> Result<Self, PolicyError> {
        self.validate()?;
        Ok(self)
    }

    /// Validate the invariants the registry enforces: `capacity >= 1`, a
    /// finite non-negative refill rate, and a positive window for window
    /// algorithms.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second < 0.0 {
            return Err(PolicyError::InvalidRefillRate(self.refill_per_second));
        }
        if self.algorithm.is_windowed() && self.window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        Ok(())
    }

    /// Capacity as a float, the unit the accounting math works in.
    pub fn capacity_f64(&self) -> f64 {
        self.capacity as f64
    }

    /// Whether `cost` can ever be admitted under this policy.
    pub fn admits_cost(&self, cost: f64) -> bool {
        cost > 0.0 && cost <= self.capacity_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_validation() {
        assert!(Policy::token_bucket(10, 1.0).is_ok());
        assert!(Policy::token_bucket(1, 0.0).is_ok());

        assert_eq!(
            Policy::token_bucket(0, 1.0).unwrap_err(),
            PolicyError::ZeroCapacity
        );
        assert!(matches!(
            Policy::token_bucket(10, -1.0).unwrap_err(),
            PolicyError::InvalidRefillRate(_)
        ));
        assert!(matches!(
            Policy::token_bucket(10, f64::NAN).unwrap_err(),
            PolicyError::InvalidRefillRate(_)
        ));
    }

    #[test]
    fn test_window_algorithms_require_window() {
        assert_eq!(
            Policy::fixed_window(100, Duration::ZERO).unwrap_err(),
            PolicyError::ZeroWindow
        );
        assert!(Policy::fixed_window(100, Duration::from_secs(60)).is_ok());
        assert!(Policy::sliding_window_counter(100, Duration::from_secs(60)).is_ok());
        assert!(Policy::sliding_window_log(100, Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_token_bucket_ignores_window_requirement() {
        // A zero window is fine for the token bucket
        let policy = Policy::token_bucket(10, 1.0).unwrap();
        assert!(policy.window.is_zero());
        assert!(!policy.algorithm.is_windowed());
    }

    #[test]
    fn test_admits_cost() {
        let policy = Policy::token_bucket(10, 1.0).unwrap();
        assert!(policy.admits_cost(1.0));
        assert!(policy.admits_cost(10.0));
        assert!(!policy.admits_cost(0.0));
        assert!(!policy.admits_cost(-1.0));
        assert!(!policy.admits_cost(10.5));
    }
}
