use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifies a cacheable computation result.
///
/// The key is used verbatim as the key of the cache entry in the store. The lock record and the
/// notification channel for a resource are derived from it by prefixing a fixed namespace, see
/// [`lock_key`](Self::lock_key) and [`notify_channel`](Self::notify_channel).
///
/// **NOTE**: Different deployments sharing one store must agree on the prefixes, otherwise they
/// will not see each other's locks and will compute concurrently.
///
/// Keys are not checked against the prefixes. A key starting with the lock prefix names the
/// lock record of another resource, see [`CoalescingConfig::lock_prefix`].
///
/// [`CoalescingConfig::lock_prefix`]: crate::config::CoalescingConfig::lock_prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key of the lock record guarding production of this resource.
    pub fn lock_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }

    /// Returns the channel on which completion of this resource is announced.
    pub fn notify_channel(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}
