//! Policy registry mapping rate-limit keys to quota policies.
//!
//! Lookup order: exact key match, then longest-prefix wildcard
//! (`"tenant:*"`), then the global default. Registration is the only place
//! in the crate where an error is fatal; everything at decision time is
//! absorbed into the decision itself.

use crate::domain::key::RateLimitKey;
use crate::domain::policy::{Policy, PolicyError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Pattern of the implicit global default policy.
pub const DEFAULT_PATTERN: &str = "*";

/// A policy resolved for a key, together with the pattern that matched and
/// the registration version (bumped on every accepted registration,
/// last-writer-wins).
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub policy: Policy,
    pub pattern: Arc<str>,
    pub version: u64,
}

#[derive(Debug, Clone)]
struct Registration {
    policy: Policy,
    version: u64,
}

/// Registry of quota policies, hot-reloadable at runtime.
///
/// `set_policy` may be called at any time; subsequent `resolve` calls see the
/// new policy and its bumped version, which invalidates cached leases and
/// accounting state built against the old one.
#[derive(Debug)]
pub struct PolicyRegistry {
    exact: DashMap<Arc<str>, Registration, ahash::RandomState>,
    /// Wildcard entries as (prefix, full pattern, registration), longest
    /// prefix first. Small and rarely written.
    wildcards: RwLock<Vec<(Arc<str>, Arc<str>, Registration)>>,
    default: RwLock<Registration>,
    default_pattern: Arc<str>,
    next_version: AtomicU64,
}

impl PolicyRegistry {
    /// Create a registry with a global default policy.
    ///
    /// The default is validated like any registration.
    pub fn new(default_policy: Policy) -> Result<Self, PolicyError> {
        default_policy.validate()?;
        Ok(Self {
            exact: DashMap::with_hasher(ahash::RandomState::new()),
            wildcards: RwLock::new(Vec::new()),
            default: RwLock::new(Registration {
                policy: default_policy,
                version: 1,
            }),
            default_pattern: Arc::from(DEFAULT_PATTERN),
            next_version: AtomicU64::new(2),
        })
    }

    /// Register or replace the policy for a pattern.
    ///
    /// Patterns ending in `*` match by prefix (`"tenant:*"`); the bare `"*"`
    /// replaces the global default; anything else matches exactly.
    /// Validation failures reject the registration and leave the previous
    /// policy in place.
    pub fn set_policy(&self, pattern: &str, policy: Policy) -> Result<(), PolicyError> {
        policy.validate()?;
        let registration = Registration {
            policy,
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
        };

        if pattern == DEFAULT_PATTERN {
            *self.default.write().expect("registry default lock poisoned") = registration;
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            let mut wildcards = self
                .wildcards
                .write()
                .expect("registry wildcard lock poisoned");
            match wildcards.iter_mut().find(|(p, _, _)| p.as_ref() == prefix) {
                Some((_, _, existing)) => *existing = registration,
                None => {
                    wildcards.push((Arc::from(prefix), Arc::from(pattern), registration));
                    // Longest prefix first so resolution can take the first hit
                    wildcards.sort_by(|(a, _, _), (b, _, _)| b.len().cmp(&a.len()));
                }
            }
        } else {
            self.exact.insert(Arc::from(pattern), registration);
        }
        Ok(())
    }

    /// Fetch the policy registered under a pattern, if any.
    ///
    /// `"*"` returns the global default.
    pub fn get_policy(&self, pattern: &str) -> Option<Policy> {
        if pattern == DEFAULT_PATTERN {
            return Some(
                self.default
                    .read()
                    .expect("registry default lock poisoned")
                    .policy
                    .clone(),
            );
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            let wildcards = self
                .wildcards
                .read()
                .expect("registry wildcard lock poisoned");
            return wildcards
                .iter()
                .find(|(p, _, _)| p.as_ref() == prefix)
                .map(|(_, _, r)| r.policy.clone());
        }
        self.exact.get(pattern).map(|r| r.policy.clone())
    }

    /// Remove a registered pattern. The default cannot be removed.
    pub fn remove_policy(&self, pattern: &str) -> bool {
        if pattern == DEFAULT_PATTERN {
            return false;
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            let mut wildcards = self
                .wildcards
                .write()
                .expect("registry wildcard lock poisoned");
            let before = wildcards.len();
            wildcards.retain(|(p, _, _)| p.as_ref() != prefix);
            return wildcards.len() != before;
        }
        self.exact.remove(pattern).is_some()
    }

    /// Resolve the policy governing a key.
    ///
    /// Never fails: a key with no registration falls back to the global
    /// default (`PolicyNotFound` is not an error to callers).
    pub fn resolve(&self, key: &RateLimitKey) -> ResolvedPolicy {
        if let Some(entry) = self.exact.get(key.as_str()) {
            return ResolvedPolicy {
                policy: entry.policy.clone(),
                pattern: Arc::clone(entry.key()),
                version: entry.version,
            };
        }

        {
            let wildcards = self
                .wildcards
                .read()
                .expect("registry wildcard lock poisoned");
            for (prefix, pattern, registration) in wildcards.iter() {
                if key.as_str().starts_with(prefix.as_ref()) {
                    return ResolvedPolicy {
                        policy: registration.policy.clone(),
                        pattern: Arc::clone(pattern),
                        version: registration.version,
                    };
                }
            }
        }

        let default = self.default.read().expect("registry default lock poisoned");
        ResolvedPolicy {
            policy: default.policy.clone(),
            pattern: Arc::clone(&self.default_pattern),
            version: default.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::new(Policy::token_bucket(100, 10.0).unwrap()).unwrap()
    }

    #[test]
    fn test_resolution_order() {
        let registry = registry();
        registry
            .set_policy("tenant:*", Policy::token_bucket(50, 5.0).unwrap())
            .unwrap();
        registry
            .set_policy("tenant:vip:*", Policy::token_bucket(500, 50.0).unwrap())
            .unwrap();
        registry
            .set_policy("tenant:vip:acme", Policy::token_bucket(1000, 100.0).unwrap())
            .unwrap();

        // Exact beats wildcard
        let resolved = registry.resolve(&RateLimitKey::new("tenant:vip:acme"));
        assert_eq!(resolved.policy.capacity, 1000);
        assert_eq!(resolved.pattern.as_ref(), "tenant:vip:acme");

        // Longest prefix wins
        let resolved = registry.resolve(&RateLimitKey::new("tenant:vip:other"));
        assert_eq!(resolved.policy.capacity, 500);
        assert_eq!(resolved.pattern.as_ref(), "tenant:vip:*");

        let resolved = registry.resolve(&RateLimitKey::new("tenant:basic"));
        assert_eq!(resolved.policy.capacity, 50);

        // Unknown keys fall back to the default
        let resolved = registry.resolve(&RateLimitKey::new("other"));
        assert_eq!(resolved.policy.capacity, 100);
        assert_eq!(resolved.pattern.as_ref(), DEFAULT_PATTERN);
    }

    #[test]
    fn test_invalid_registration_is_rejected() {
        let registry = registry();
        let err = registry
            .set_policy("bad", Policy {
                capacity: 0,
                refill_per_second: 1.0,
                algorithm: crate::domain::policy::Algorithm::TokenBucket,
                window: Duration::ZERO,
            })
            .unwrap_err();
        assert_eq!(err, PolicyError::ZeroCapacity);
        assert!(registry.get_policy("bad").is_none());
    }

    #[test]
    fn test_last_writer_wins_bumps_version() {
        let registry = registry();
        registry
            .set_policy("api", Policy::token_bucket(10, 1.0).unwrap())
            .unwrap();
        let v1 = registry.resolve(&RateLimitKey::new("api")).version;

        registry
            .set_policy("api", Policy::token_bucket(20, 2.0).unwrap())
            .unwrap();
        let resolved = registry.resolve(&RateLimitKey::new("api"));
        assert_eq!(resolved.policy.capacity, 20);
        assert!(resolved.version > v1);
    }

    #[test]
    fn test_default_replacement_and_get() {
        let registry = registry();
        assert_eq!(registry.get_policy(DEFAULT_PATTERN).unwrap().capacity, 100);

        registry
            .set_policy(DEFAULT_PATTERN, Policy::token_bucket(7, 1.0).unwrap())
            .unwrap();
        assert_eq!(registry.get_policy(DEFAULT_PATTERN).unwrap().capacity, 7);
        assert_eq!(
            registry.resolve(&RateLimitKey::new("anything")).policy.capacity,
            7
        );
    }

    #[test]
    fn test_remove_policy() {
        let registry = registry();
        registry
            .set_policy("tenant:*", Policy::token_bucket(50, 5.0).unwrap())
            .unwrap();

        assert!(registry.remove_policy("tenant:*"));
        assert!(!registry.remove_policy("tenant:*"));
        assert!(!registry.remove_policy(DEFAULT_PATTERN));

        let resolved = registry.resolve(&RateLimitKey::new("tenant:basic"));
        assert_eq!(resolved.pattern.as_ref(), DEFAULT_PATTERN);
    }

    #[test]
    fn test_window_policy_registration() {
        let registry = registry();
        assert!(registry
            .set_policy(
                "search:*",
                Policy::sliding_window_log(100, Duration::from_secs(60)).unwrap()
            )
            .is_ok());
    }
}
