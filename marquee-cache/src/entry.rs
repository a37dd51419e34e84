//! Cache entry lifecycle and freshness classification.
//!
//! An entry is created on the first successful fetch, overwritten on every
//! refresh, and deleted only by explicit invalidation or a whole-cache
//! clear. Classification is a pure function of the entry and a supplied
//! "now", so `stats()` and `get()` agree by construction.

use chrono::{DateTime, TimeDelta, Utc};
use marquee_core::{FetchError, Timestamp};
use std::time::Duration;

/// Freshness of a cache entry relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within the stale threshold; serve directly.
    Fresh,
    /// Past the stale threshold but not expired; serve while refreshing.
    Stale,
    /// Past `expires_at`; callers must wait for a fresh fetch.
    Expired,
}

/// A cached value with its freshness bookkeeping.
///
/// `last_error` records the most recent failed refresh for this key and is
/// cleared by the next successful fetch; it is what makes a served value
/// report as stale.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Timestamp,
    pub expires_at: Timestamp,
    pub last_error: Option<FetchError>,
}

impl<V> CacheEntry<V> {
    /// Create an entry fetched at the given instant with the given TTL.
    pub fn new(value: V, fetched_at: Timestamp, ttl: Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let expires_at = fetched_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            value,
            fetched_at,
            expires_at,
            last_error: None,
        }
    }

    /// Classify this entry against `now`.
    ///
    /// `stale_threshold` is the fraction of the TTL after which a live entry
    /// becomes stale-but-usable. Expiry is strict: an entry observed exactly
    /// at `expires_at` is still usable.
    pub fn classify(&self, now: Timestamp, stale_threshold: f64) -> Freshness {
        if now > self.expires_at {
            return Freshness::Expired;
        }
        let ttl_ms = (self.expires_at - self.fetched_at).num_milliseconds();
        let age_ms = (now - self.fetched_at).num_milliseconds();
        if age_ms as f64 > ttl_ms as f64 * stale_threshold {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

/// Where the value in a [`CacheRead`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Served from a fresh cache entry.
    Hit,
    /// Served from a stale or expired cache entry.
    StaleHit,
    /// Produced by a fetch completed during this read.
    Fetched,
    /// Fell back to the caller-supplied initial value (fetching disabled).
    Initial,
}

/// Result of a cache read, carrying staleness metadata.
///
/// A failed refresh never evicts cached data; instead the retained value is
/// returned here with `is_stale` set and the error attached so the caller
/// can decide to show a "using cached data" indicator.
#[derive(Debug, Clone)]
pub struct CacheRead<V> {
    value: V,
    fetched_at: Timestamp,
    source: ReadSource,
    is_stale: bool,
    error: Option<FetchError>,
}

impl<V> CacheRead<V> {
    /// Read served from an existing entry.
    pub(crate) fn hit(entry: &CacheEntry<V>, freshness: Freshness) -> Self
    where
        V: Clone,
    {
        Self {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            source: match freshness {
                Freshness::Fresh => ReadSource::Hit,
                Freshness::Stale | Freshness::Expired => ReadSource::StaleHit,
            },
            is_stale: entry.last_error.is_some() || freshness == Freshness::Expired,
            error: entry.last_error.clone(),
        }
    }

    /// Read produced by a fetch that completed during this call.
    pub(crate) fn fetched(value: V, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            source: ReadSource::Fetched,
            is_stale: false,
            error: None,
        }
    }

    /// Read serving a retained value after a failed fetch.
    pub(crate) fn stale_with_error(value: V, fetched_at: Timestamp, error: FetchError) -> Self {
        Self {
            value,
            fetched_at,
            source: ReadSource::StaleHit,
            is_stale: true,
            error: Some(error),
        }
    }

    /// Read serving the caller-supplied initial value.
    pub(crate) fn initial(value: V, now: Timestamp) -> Self {
        Self {
            value,
            fetched_at: now,
            source: ReadSource::Initial,
            is_stale: false,
            error: None,
        }
    }

    /// Get a reference to the value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consume the read and return the value.
    pub fn into_value(self) -> V {
        self.value
    }

    /// When the value was obtained from its fetch.
    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    /// Where the value came from.
    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// True when the value was retained past a failed refresh or expiry.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// The fetch error attached to this read, if any.
    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    /// True when the value came from the cache rather than a new fetch.
    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Hit | ReadSource::StaleHit)
    }
}
