//! Per-key quota accounting state.
//!
//! This module implements the four accounting algorithms behind a single
//! [`Limiter`] capability ({try_consume, peek, reset}) dispatched through the
//! [`QuotaState`] tagged enum, so call sites never branch on the algorithm.
//!
//! The accounting logic itself never fails: a denial is a normal outcome and
//! never mutates state. Elapsed time is always computed with
//! `saturating_duration_since`, so a clock observed moving backward yields
//! "no refill this tick" rather than negative credit.

use crate::domain::policy::{Algorithm, Policy};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tolerance for float accounting; ties (tokens == cost) are allowed.
const COST_EPSILON: f64 = 1e-9;

/// Outcome of a consume or peek against a quota state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the cost was admitted.
    pub allowed: bool,
    /// Estimated tokens remaining after the call.
    pub remaining: f64,
    /// Time until a retry with the same cost could succeed. `None` means
    /// waiting will not help (e.g. refill rate is zero).
    pub retry_after: Option<Duration>,
}

impl Admission {
    fn allowed(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
        }
    }

    fn denied(remaining: f64, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
        }
    }
}

/// Capability set shared by all accounting algorithms.
pub trait Limiter {
    /// Refresh the state to `now` and consume `cost` if available.
    ///
    /// Ties are admitted; denials do not mutate the token count.
    fn try_consume(&mut self, policy: &Policy, cost: f64, now: Instant) -> Admission;

    /// Estimate available tokens at `now` without mutating state.
    fn peek(&self, policy: &Policy, now: Instant) -> f64;

    /// Restore the state to full quota as of `now`.
    fn reset(&mut self, policy: &Policy, now: Instant);
}

/// Token bucket: continuous refill, bursts up to capacity.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketState {
    /// A full bucket as of `now`.
    pub fn new(policy: &Policy, now: Instant) -> Self {
        Self {
            tokens: policy.capacity_f64(),
            last_refill: now,
        }
    }

    fn refreshed_tokens(&self, policy: &Policy, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * policy.refill_per_second)
            .min(policy.capacity_f64())
    }

    fn refresh(&mut self, policy: &Policy, now: Instant) {
        self.tokens = self.refreshed_tokens(policy, now);
        // A backward clock must not rewind the refill anchor either.
        self.last_refill = self.last_refill.max(now);
    }
}

impl Limiter for TokenBucketState {
    fn try_consume(&mut self, policy: &Policy, cost: f64, now: Instant) -> Admission {
        self.refresh(policy, now);
        if self.tokens + COST_EPSILON >= cost {
            self.tokens -= cost;
            Admission::allowed(self.tokens)
        } else {
            let retry_after = if policy.refill_per_second > 0.0 {
                Some(Duration::from_secs_f64(
                    (cost - self.tokens) / policy.refill_per_second,
                ))
            } else {
                None
            };
            Admission::denied(self.tokens, retry_after)
        }
    }

    fn peek(&self, policy: &Policy, now: Instant) -> f64 {
        self.refreshed_tokens(policy, now)
    }

    fn reset(&mut self, policy: &Policy, now: Instant) {
        self.tokens = policy.capacity_f64();
        self.last_refill = now;
    }
}

/// Fixed window counter with deterministic boundaries.
///
/// Boundaries fall at whole multiples of the window from the state's epoch,
/// so a long idle gap lands the state in the correct current window rather
/// than one window ahead.
#[derive(Debug, Clone)]
pub struct FixedWindowState {
    window_start: Instant,
    consumed: f64,
}

impl FixedWindowState {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            consumed: 0.0,
        }
    }

    fn roll(&mut self, policy: &Policy, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= policy.window {
            // Keep boundaries phase-aligned with the epoch.
            let remainder = elapsed.as_nanos() % policy.window.as_nanos();
            self.window_start = now - Duration::from_nanos(remainder as u64);
            self.consumed = 0.0;
        }
    }

    fn rolled_consumed(&self, policy: &Policy, now: Instant) -> f64 {
        if now.saturating_duration_since(self.window_start) >= policy.window {
            0.0
        } else {
            self.consumed
        }
    }
}

impl Limiter for FixedWindowState {
    fn try_consume(&mut self, policy: &Policy, cost: f64, now: Instant) -> Admission {
        self.roll(policy, now);
        let capacity = policy.capacity_f64();
        if self.consumed + cost <= capacity + COST_EPSILON {
            self.consumed += cost;
            Admission::allowed(capacity - self.consumed)
        } else {
            let next_boundary = self.window_start + policy.window;
            Admission::denied(
                capacity - self.consumed,
                Some(next_boundary.saturating_duration_since(now)),
            )
        }
    }

    fn peek(&self, policy: &Policy, now: Instant) -> f64 {
        policy.capacity_f64() - self.rolled_consumed(policy, now)
    }

    fn reset(&mut self, _policy: &Policy, now: Instant) {
        self.window_start = now;
        self.consumed = 0.0;
    }
}

/// Sliding window counter: blends the previous and current fixed window
/// proportionally to how far into the current window the request arrives.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounterState {
    window_start: Instant,
    current: f64,
    previous: f64,
}

impl SlidingWindowCounterState {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            current: 0.0,
            previous: 0.0,
        }
    }

    fn roll(&mut self, policy: &Policy, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= policy.window {
            // An immediately preceding window carries over; anything older
            // has fully aged out.
            self.previous = if elapsed < policy.window * 2 {
                self.current
            } else {
                0.0
            };
            self.current = 0.0;
            let remainder = elapsed.as_nanos() % policy.window.as_nanos();
            self.window_start = now - Duration::from_nanos(remainder as u64);
        }
    }

    /// Fraction of the current window already elapsed, in [0, 1).
    fn fraction(&self, policy: &Policy, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        (elapsed.as_secs_f64() / policy.window.as_secs_f64()).min(1.0)
    }

    fn weighted(&self, policy: &Policy, now: Instant) -> f64 {
        self.previous * (1.0 - self.fraction(policy, now)) + self.current
    }
}

impl Limiter for SlidingWindowCounterState {
    fn try_consume(&mut self, policy: &Policy, cost: f64, now: Instant) -> Admission {
        self.roll(policy, now);
        let capacity = policy.capacity_f64();
        let weighted = self.weighted(policy, now);
        if weighted + cost <= capacity + COST_EPSILON {
            self.current += cost;
            Admission::allowed(capacity - weighted - cost)
        } else {
            // Earliest fraction at which the decayed previous window admits
            // the cost, clamped to the current window's remainder.
            let fraction = self.fraction(policy, now);
            let deficit = weighted + cost - capacity;
            let to_boundary = policy.window.mul_f64(1.0 - fraction);
            let retry_after = if self.previous > 0.0 {
                let decay = deficit / self.previous;
                if fraction + decay <= 1.0 {
                    policy.window.mul_f64(decay)
                } else {
                    to_boundary
                }
            } else {
                to_boundary
            };
            Admission::denied(capacity - weighted, Some(retry_after))
        }
    }

    fn peek(&self, policy: &Policy, now: Instant) -> f64 {
        let mut probe = self.clone();
        probe.roll(policy, now);
        policy.capacity_f64() - probe.weighted(policy, now)
    }

    fn reset(&mut self, _policy: &Policy, now: Instant) {
        self.window_start = now;
        self.current = 0.0;
        self.previous = 0.0;
    }
}

/// Sliding window log: one timestamped entry per admitted cost.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowLogState {
    entries: VecDeque<(Instant, f64)>,
    total: f64,
}

impl SlidingWindowLogState {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_expired(&mut self, policy: &Policy, now: Instant) {
        while let Some(&(oldest, cost)) = self.entries.front() {
            if now.saturating_duration_since(oldest) > policy.window {
                self.entries.pop_front();
                self.total -= cost;
            } else {
                break;
            }
        }
        if self.entries.is_empty() {
            self.total = 0.0;
        }
    }

    fn live_total(&self, policy: &Policy, now: Instant) -> f64 {
        self.entries
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= policy.window)
            .map(|(_, c)| c)
            .sum()
    }
}

impl Limiter for SlidingWindowLogState {
    fn try_consume(&mut self, policy: &Policy, cost: f64, now: Instant) -> Admission {
        self.evict_expired(policy, now);
        let capacity = policy.capacity_f64();
        if self.total + cost <= capacity + COST_EPSILON {
            self.entries.push_back((now, cost));
            self.total += cost;
            Admission::allowed(capacity - self.total)
        } else {
            // Walk the oldest entries until enough cost has aged out.
            let mut freed = 0.0;
            let mut retry_after = None;
            for &(stamp, entry_cost) in &self.entries {
                freed += entry_cost;
                if self.total - freed + cost <= capacity + COST_EPSILON {
                    let exits_at = stamp + policy.window;
                    retry_after = Some(exits_at.saturating_duration_since(now));
                    break;
                }
            }
            Admission::denied(capacity - self.total, retry_after)
        }
    }

    fn peek(&self, policy: &Policy, now: Instant) -> f64 {
        policy.capacity_f64() - self.live_total(policy, now)
    }

    fn reset(&mut self, _policy: &Policy, _now: Instant) {
        self.entries.clear();
        self.total = 0.0;
    }
}

/// Algorithm-tagged per-key quota state.
///
/// Carries the version of the policy that created it so a hot-reloaded
/// policy rebuilds accounting from scratch instead of mixing units.
#[derive(Debug, Clone)]
pub struct QuotaState {
    state: AlgorithmState,
    /// Policy registration version this state was built against.
    pub policy_version: u64,
}

#[derive(Debug, Clone)]
enum AlgorithmState {
    TokenBucket(TokenBucketState),
    FixedWindow(FixedWindowState),
    SlidingWindowCounter(SlidingWindowCounterState),
    SlidingWindowLog(SlidingWindowLogState),
}

impl QuotaState {
    /// Fresh full-quota state for a policy.
    pub fn new(policy: &Policy, policy_version: u64, now: Instant) -> Self {
        let state = match policy.algorithm {
            Algorithm::TokenBucket => {
                AlgorithmState::TokenBucket(TokenBucketState::new(policy, now))
            }
            Algorithm::FixedWindow => AlgorithmState::FixedWindow(FixedWindowState::new(now)),
            Algorithm::SlidingWindowCounter => {
                AlgorithmState::SlidingWindowCounter(SlidingWindowCounterState::new(now))
            }
            Algorithm::SlidingWindowLog => {
                AlgorithmState::SlidingWindowLog(SlidingWindowLogState::new())
            }
        };
        Self {
            state,
            policy_version,
        }
    }
}

impl Limiter for QuotaState {
    fn try_consume(&mut self, policy: &Policy, cost: f64, now: Instant) -> Admission {
        match &mut self.state {
            AlgorithmState::TokenBucket(s) => s.try_consume(policy, cost, now),
            AlgorithmState::FixedWindow(s) => s.try_consume(policy, cost, now),
            AlgorithmState::SlidingWindowCounter(s) => s.try_consume(policy, cost, now),
            AlgorithmState::SlidingWindowLog(s) => s.try_consume(policy, cost, now),
        }
    }

    fn peek(&self, policy: &Policy, now: Instant) -> f64 {
        match &self.state {
            AlgorithmState::TokenBucket(s) => s.peek(policy, now),
            AlgorithmState::FixedWindow(s) => s.peek(policy, now),
            AlgorithmState::SlidingWindowCounter(s) => s.peek(policy, now),
            AlgorithmState::SlidingWindowLog(s) => s.peek(policy, now),
        }
    }

    fn reset(&mut self, policy: &Policy, now: Instant) {
        match &mut self.state {
            AlgorithmState::TokenBucket(s) => s.reset(policy, now),
            AlgorithmState::FixedWindow(s) => s.reset(policy, now),
            AlgorithmState::SlidingWindowCounter(s) => s.reset(policy, now),
            AlgorithmState::SlidingWindowLog(s) => s.reset(policy, now),
        }
    }
}
