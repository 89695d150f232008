//! Local lease cache: the no-I/O fast path.
//!
//! A lease is a time-bounded slice of global quota that the store already
//! deducted on our behalf. While a key holds an unexpired lease with enough
//! local tokens, checks decide locally without touching the network. Leases
//! are strictly a latency optimization: every leased token was removed from
//! the authoritative store when granted, so the sum of outstanding leases
//! plus the store remainder can never admit more than global capacity.
//! Tokens left in an expired lease are forfeited, which only errs on the
//! strict side of that invariant.

use crate::application::ports::Storage;
use crate::domain::key::RateLimitKey;
use std::time::Instant;

const COST_EPSILON: f64 = 1e-9;

/// A borrowed slice of global quota, private to this process.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Tokens granted by the store, already deducted globally.
    pub granted: f64,
    /// Tokens still spendable locally.
    pub local_remaining: f64,
    /// Authoritative store remainder observed when the lease was granted.
    /// Used to estimate `Decision::remaining` on local hits.
    pub store_remaining: f64,
    /// Leases die at this instant regardless of remaining tokens.
    pub expires_at: Instant,
    /// Policy registration version the lease was granted under; a reloaded
    /// policy invalidates it.
    pub policy_version: u64,
}

impl Lease {
    fn is_valid(&self, policy_version: u64, now: Instant) -> bool {
        self.policy_version == policy_version && now < self.expires_at
    }
}

/// Outcome of a local fast-path hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalHit {
    /// Estimated tokens remaining (store snapshot plus the local slice).
    pub remaining: f64,
}

/// Per-process cache of leases, one per key.
///
/// Mutation happens under the storage entry lock, so concurrent tasks
/// decrementing the same lease serialize per key and never double-spend a
/// token; distinct keys do not contend.
#[derive(Debug)]
pub struct LeaseCache<S>
where
    S: Storage<RateLimitKey, Lease>,
{
    storage: S,
    max_keys: usize,
}

impl<S> LeaseCache<S>
where
    S: Storage<RateLimitKey, Lease>,
{
    /// Create a cache bounded to `max_keys` tracked keys.
    pub fn new(storage: S, max_keys: usize) -> Self {
        Self { storage, max_keys }
    }

    /// Try to admit `cost` from the key's lease without any network call.
    ///
    /// Returns `None` when there is no usable lease (missing, expired, stale
    /// policy version, or insufficient local tokens); the caller then
    /// consults the shared store. Invalid leases are dropped on sight.
    pub fn try_local(
        &self,
        key: &RateLimitKey,
        cost: f64,
        policy_version: u64,
        now: Instant,
    ) -> Option<LocalHit> {
        let hit = self.storage.with_existing_mut(key, |lease| {
            if !lease.is_valid(policy_version, now) {
                return Err(true); // stale, remove
            }
            if lease.local_remaining + COST_EPSILON < cost {
                return Err(false); // keep for smaller costs
            }
            lease.local_remaining -= cost;
            Ok(LocalHit {
                remaining: lease.store_remaining + lease.local_remaining,
            })
        })?;

        match hit {
            Ok(hit) => Some(hit),
            Err(stale) => {
                if stale {
                    self.storage.remove(key);
                }
                None
            }
        }
    }

    /// Install the lease for a key after a store grant.
    ///
    /// A still-valid lease for the same policy version is merged rather than
    /// replaced: its leftover tokens were already paid for at the store and
    /// remain spendable.
    pub fn install(&self, key: &RateLimitKey, lease: Lease, now: Instant) {
        // The factory seeds an already-expired placeholder so the accessor
        // takes the replace branch for fresh entries and the merge branch
        // only for genuinely pre-existing leases.
        let placeholder = Lease {
            granted: 0.0,
            local_remaining: 0.0,
            store_remaining: 0.0,
            expires_at: now,
            policy_version: lease.policy_version,
        };
        self.storage.with_entry_mut(
            key.clone(),
            || placeholder,
            |slot| {
                if slot.is_valid(lease.policy_version, now) {
                    slot.granted += lease.granted;
                    slot.local_remaining += lease.granted;
                    slot.store_remaining = lease.store_remaining;
                    slot.expires_at = lease.expires_at;
                } else {
                    *slot = lease.clone();
                }
            },
        );
        if self.storage.len() > self.max_keys {
            self.trim(now);
        }
    }

    /// Tokens spendable locally for a key, excluding the store snapshot.
    pub fn local_tokens(&self, key: &RateLimitKey, policy_version: u64, now: Instant) -> f64 {
        self.storage
            .with_existing_mut(key, |lease| {
                if lease.is_valid(policy_version, now) {
                    lease.local_remaining
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0)
    }

    /// Non-mutating estimate of remaining tokens visible from this process.
    pub fn peek_remaining(&self, key: &RateLimitKey, policy_version: u64, now: Instant) -> f64 {
        self.storage
            .with_existing_mut(key, |lease| {
                if lease.is_valid(policy_version, now) {
                    lease.store_remaining + lease.local_remaining
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0)
    }

    /// Drop the lease for a key, forfeiting any unused local tokens.
    pub fn release(&self, key: &RateLimitKey) -> bool {
        self.storage.remove(key)
    }

    /// Drop all leases.
    pub fn clear(&self) {
        self.storage.clear();
    }

    /// Number of keys currently holding a lease.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether no leases are held.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Enforce the key cap: expired leases go first, then the entries
    /// closest to expiry (they are worth the least).
    fn trim(&self, now: Instant) {
        self.storage.retain(|_, lease| now < lease.expires_at);
        let excess = self.storage.len().saturating_sub(self.max_keys);
        if excess == 0 {
            return;
        }

        let mut expiries: Vec<(RateLimitKey, Instant)> = Vec::with_capacity(self.storage.len());
        self.storage
            .for_each(|key, lease| expiries.push((key.clone(), lease.expires_at)));
        expiries.sort_by_key(|(_, expires_at)| *expires_at);
        for (key, _) in expiries.into_iter().take(excess) {
            self.storage.remove(&key);
        }
    }
}
