//! Namespaced cache keys.
//!
//! A `Keyspace` builds keys of the form `namespace:segment`, giving every
//! class of cached reads a common prefix that `invalidate_by_prefix` can
//! target after a write. Segments may not contain the separator, so a key
//! can never collide across namespaces.

use std::future::Future;
use std::time::Duration;

use marquee_core::{ConfigError, FetchError};
use tracing::debug;

use crate::cache::ReadThroughCache;

/// Separator between the namespace and the segment.
const SEPARATOR: char = ':';

/// A key namespace for one class of cached reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    /// Create a keyspace.
    ///
    /// The namespace must be non-empty and must not contain the separator.
    pub fn new(namespace: impl Into<String>) -> Result<Self, ConfigError> {
        let namespace = namespace.into();
        if namespace.is_empty() || namespace.contains(SEPARATOR) {
            return Err(ConfigError::InvalidValue {
                field: "namespace".to_string(),
                value: namespace,
                reason: format!("must be non-empty and must not contain '{SEPARATOR}'"),
            });
        }
        Ok(Self { namespace })
    }

    /// The namespace this keyspace scopes keys to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Build a namespaced key for `segment`.
    ///
    /// Segments containing the separator are rejected; otherwise two
    /// distinct (namespace, segment) pairs could produce the same key.
    pub fn key(&self, segment: &str) -> Result<String, ConfigError> {
        if segment.is_empty() || segment.contains(SEPARATOR) {
            return Err(ConfigError::InvalidValue {
                field: "segment".to_string(),
                value: segment.to_string(),
                reason: format!("must be non-empty and must not contain '{SEPARATOR}'"),
            });
        }
        Ok(format!("{}{}{}", self.namespace, SEPARATOR, segment))
    }

    /// The prefix shared by every key in this keyspace.
    pub fn prefix(&self) -> String {
        format!("{}{}", self.namespace, SEPARATOR)
    }

    /// True when `key` belongs to this keyspace.
    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(&self.prefix())
    }

    /// Invalidate every cached entry in this keyspace.
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_all<V>(&self, cache: &ReadThroughCache<V>) -> usize
    where
        V: Clone + Send + Sync + 'static,
    {
        cache.invalidate_by_prefix(&self.prefix()).await
    }

    /// Prefetch a batch of segments through this keyspace.
    ///
    /// Best-effort warm-up: fetch errors are swallowed by `prefetch`, and
    /// invalid segments are skipped. Returns the number of segments
    /// attempted.
    pub async fn warm<V, S, F, Fut>(
        &self,
        cache: &ReadThroughCache<V>,
        segments: &[S],
        ttl: Duration,
        fetch_for: F,
    ) -> usize
    where
        V: Clone + Send + Sync + 'static,
        S: AsRef<str>,
        F: Fn(&str) -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let mut attempted = 0;
        for segment in segments {
            let segment = segment.as_ref();
            let key = match self.key(segment) {
                Ok(key) => key,
                Err(err) => {
                    debug!(segment, error = %err, "Skipping warm-up for invalid segment");
                    continue;
                }
            };
            let fut = fetch_for(segment);
            cache.prefetch(&key, ttl, move || fut).await;
            attempted += 1;
        }
        attempted
    }
}
