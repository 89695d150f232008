//! Rate limit keys identifying the entity a quota applies to.

use std::fmt;
use std::sync::Arc;

/// Opaque identifier for a rate-limited entity.
///
/// Keys are immutable and cheap to clone (`Arc<str>` internally), making them
/// suitable as map keys in hot paths. Composite keys join a subject and a
/// resource with `:`, e.g. `tenant-42:search-api`.
///
/// # Examples
///
/// ```
/// use quota_gate::RateLimitKey;
///
/// let key = RateLimitKey::new("tenant-42");
/// let composite = RateLimitKey::composite("tenant-42", "search-api");
/// assert_eq!(composite.as_str(), "tenant-42:search-api");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(Arc<str>);

impl RateLimitKey {
    /// Create a key from any string-like value.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Create a composite key from a subject and a resource.
    pub fn composite(subject: impl AsRef<str>, resource: impl AsRef<str>) -> Self {
        Self(Arc::from(
            format!("{}:{}", subject.as_ref(), resource.as_ref()).as_str(),
        ))
    }

    /// View the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateLimitKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RateLimitKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}
