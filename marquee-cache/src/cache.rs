//! Read-through cache with stale-while-revalidate refresh.
//!
//! Per-key deduplication is a synchronous claim: whichever caller first
//! inserts the key's in-flight slot (under the state lock) owns the fetch,
//! and every caller awaits that slot's outcome. The claim covers background
//! refreshes too, so a key never has more than one outstanding fetch of any
//! kind. A claimed fetch always runs to completion in a spawned task:
//! in-flight fetches are never cancelled, and dropping a waiting caller
//! cannot strand the claim.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marquee_core::{CacheError, Clock, ConfigError, FetchError};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::entry::{CacheEntry, CacheRead, Freshness};
use crate::CacheResult;

type FetchResult<V> = Result<V, FetchError>;
type InflightTx<V> = watch::Sender<Option<FetchResult<V>>>;
type InflightRx<V> = watch::Receiver<Option<FetchResult<V>>>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the read-through cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when a `get` does not specify one.
    pub default_ttl: Duration,
    /// Fraction of the TTL after which an entry is stale-but-usable.
    pub stale_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            stale_threshold: 0.75,
        }
    }
}

impl CacheConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the stale threshold (fraction of TTL, in (0, 1]).
    pub fn with_stale_threshold(mut self, threshold: f64) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "default_ttl".to_string(),
                value: self.default_ttl,
            });
        }
        if !(self.stale_threshold > 0.0 && self.stale_threshold <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "stale_threshold".to_string(),
                value: self.stale_threshold.to_string(),
                reason: "must be in (0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-call options for [`ReadThroughCache::get`].
#[derive(Debug, Clone)]
pub struct GetOptions<V> {
    /// TTL for the entry written by this call; falls back to the config.
    pub ttl: Option<Duration>,
    /// When false, no fetching happens at all.
    pub enabled: bool,
    /// Value to serve when fetching is disabled and nothing is cached.
    pub initial: Option<V>,
}

impl<V> Default for GetOptions<V> {
    fn default() -> Self {
        Self {
            ttl: None,
            enabled: true,
            initial: None,
        }
    }
}

impl<V> GetOptions<V> {
    /// Create options with defaults (fetching enabled, config TTL).
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the TTL for this call.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Suppress all fetching for this call.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Supply a fallback value for disabled reads with no cached entry.
    pub fn with_initial(mut self, value: V) -> Self {
        self.initial = Some(value);
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Atomic counters for cache activity.
#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    background_refreshes: AtomicU64,
    fetch_failures: AtomicU64,
}

impl CacheMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_background_refresh(&self) {
        self.background_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub background_refreshes: u64,
    pub fetch_failures: u64,
}

impl CacheMetricsSnapshot {
    /// Hit rate over all reads that consulted the entry map.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Classification of every entry against the current clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
}

// ============================================================================
// CACHE
// ============================================================================

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    inflight: HashMap<String, InflightRx<V>>,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            inflight: HashMap::new(),
        }
    }
}

/// Outcome of consulting the in-flight map for a key.
enum Claim<V> {
    /// Someone else owns the fetch; await its outcome.
    Join(InflightRx<V>),
    /// This caller claimed the slot and must run the fetch.
    Claimed(InflightTx<V>),
}

/// What a `get` decided to do, resolved entirely under the state lock.
enum Action<V> {
    Serve(CacheRead<V>),
    ServeAndRefresh { read: CacheRead<V>, tx: InflightTx<V> },
    Join(InflightRx<V>),
    FetchForeground(InflightTx<V>),
}

/// Stale-while-revalidate read-through cache.
///
/// Cheaply cloneable; all clones share the same entry map. The value type is
/// opaque to the cache and cloned out on every read.
pub struct ReadThroughCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl<V> ReadThroughCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the given configuration and clock.
    ///
    /// Fails fast on an invalid configuration rather than misbehaving at
    /// read time.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(Mutex::new(CacheState::new())),
            clock,
            config,
            metrics: Arc::new(CacheMetrics::default()),
        })
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot the activity counters.
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Serve a value for `key`, fetching through `fetch` as needed.
    ///
    /// - Fresh entry: served directly, no side effects.
    /// - Stale entry: served immediately while at most one background
    ///   refresh runs for the key.
    /// - Absent or expired: the caller blocks on a fetch, deduplicated with
    ///   any other caller currently fetching the same key.
    /// - A failed fetch never evicts cached data; the retained value is
    ///   served with `is_stale` set and the error attached. Only when no
    ///   value exists at all does the error propagate.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        options: GetOptions<V>,
        fetch: F,
    ) -> CacheResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);

        let action = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = self.clock.now();

            if !options.enabled {
                if let Some(entry) = state.entries.get(key) {
                    let freshness = entry.classify(now, self.config.stale_threshold);
                    return Ok(CacheRead::hit(entry, freshness));
                }
                return match options.initial {
                    Some(value) => Ok(CacheRead::initial(value, now)),
                    None => Err(CacheError::Disabled {
                        key: key.to_string(),
                    }),
                };
            }

            let classified = state.entries.get(key).map(|entry| {
                let freshness = entry.classify(now, self.config.stale_threshold);
                (CacheRead::hit(entry, freshness), freshness)
            });

            match classified {
                Some((read, Freshness::Fresh)) => {
                    self.metrics.record_hit();
                    Action::Serve(read)
                }
                Some((read, Freshness::Stale)) => {
                    self.metrics.record_hit();
                    if state.inflight.contains_key(key) {
                        Action::Serve(read)
                    } else {
                        let (tx, rx) = watch::channel(None);
                        state.inflight.insert(key.to_string(), rx);
                        Action::ServeAndRefresh { read, tx }
                    }
                }
                Some((_, Freshness::Expired)) | None => {
                    self.metrics.record_miss();
                    match Self::claim_or_join(state, key) {
                        Claim::Join(rx) => Action::Join(rx),
                        Claim::Claimed(tx) => Action::FetchForeground(tx),
                    }
                }
            }
        };

        match action {
            Action::Serve(read) => Ok(read),
            Action::ServeAndRefresh { read, tx } => {
                self.spawn_refresh(key.to_string(), ttl, fetch(), tx);
                Ok(read)
            }
            Action::Join(rx) => self.join_inflight(key, rx).await,
            Action::FetchForeground(tx) => {
                let rx = tx.subscribe();
                self.spawn_fetch(key.to_string(), ttl, fetch(), tx);
                self.join_inflight(key, rx).await
            }
        }
    }

    /// Force a foreground fetch regardless of freshness.
    ///
    /// Joins an in-flight fetch for the key rather than starting a second
    /// one; there is no mid-flight cancellation.
    pub async fn refetch<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> CacheResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let claim = {
            let mut guard = self.state.lock().await;
            Self::claim_or_join(&mut guard, key)
        };
        match claim {
            Claim::Join(rx) => self.join_inflight(key, rx).await,
            Claim::Claimed(tx) => {
                let rx = tx.subscribe();
                self.spawn_fetch(key.to_string(), ttl, fetch(), tx);
                self.join_inflight(key, rx).await
            }
        }
    }

    /// Delete the entry for `key`, then fetch as [`Self::refetch`].
    pub async fn invalidate<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> CacheResult<CacheRead<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        {
            let mut guard = self.state.lock().await;
            guard.entries.remove(key);
        }
        self.refetch(key, ttl, fetch).await
    }

    /// Delete the entry for `key` without refetching.
    ///
    /// Returns true if an entry was present.
    pub async fn remove(&self, key: &str) -> bool {
        self.state.lock().await.entries.remove(key).is_some()
    }

    /// Delete every entry whose key starts with `prefix`.
    ///
    /// Used when a write is known to affect a class of cached reads.
    /// Returns the number of entries removed.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut guard = self.state.lock().await;
        let before = guard.entries.len();
        guard.entries.retain(|key, _| !key.starts_with(prefix));
        before - guard.entries.len()
    }

    /// Delete every entry. Returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let mut guard = self.state.lock().await;
        let removed = guard.entries.len();
        guard.entries.clear();
        removed
    }

    /// Populate the cache for `key` if it is absent or expired.
    ///
    /// Best-effort warm-up: fetch errors are swallowed and never surface to
    /// the caller.
    pub async fn prefetch<F, Fut>(&self, key: &str, ttl: Duration, fetch: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let tx = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = self.clock.now();
            let usable = state.entries.get(key).is_some_and(|entry| {
                entry.classify(now, self.config.stale_threshold) != Freshness::Expired
            });
            if usable || state.inflight.contains_key(key) {
                return;
            }
            let (tx, rx) = watch::channel(None);
            state.inflight.insert(key.to_string(), rx);
            tx
        };

        let rx = tx.subscribe();
        self.spawn_fetch(key.to_string(), ttl, fetch(), tx);
        if let Err(err) = self.join_inflight(key, rx).await {
            debug!(key, error = %err, "Prefetch failed; cache left unpopulated");
        }
    }

    /// Classify every entry against the current clock.
    pub async fn stats(&self) -> CacheStats {
        let guard = self.state.lock().await;
        let now = self.clock.now();
        let mut stats = CacheStats {
            total: guard.entries.len(),
            ..CacheStats::default()
        };
        for entry in guard.entries.values() {
            match entry.classify(now, self.config.stale_threshold) {
                Freshness::Fresh => stats.fresh += 1,
                Freshness::Stale => stats.stale += 1,
                Freshness::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Number of entries currently held.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// True when no entries are held.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn claim_or_join(state: &mut CacheState<V>, key: &str) -> Claim<V> {
        match state.inflight.get(key) {
            Some(rx) => Claim::Join(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                state.inflight.insert(key.to_string(), rx);
                Claim::Claimed(tx)
            }
        }
    }

    /// Spawn a claimed background refresh for a stale entry.
    fn spawn_refresh<Fut>(&self, key: String, ttl: Duration, fut: Fut, tx: InflightTx<V>)
    where
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        self.metrics.record_background_refresh();
        self.spawn_fetch(key, ttl, fut, tx);
    }

    /// Run a claimed fetch to completion in a spawned task and publish its
    /// outcome.
    ///
    /// The spawn is what makes the claim cancellation-safe: the in-flight
    /// slot is removed and the result published even if every caller
    /// awaiting the slot has been dropped.
    fn spawn_fetch<Fut>(&self, key: String, ttl: Duration, fut: Fut, tx: InflightTx<V>)
    where
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let result = fut.await;
            {
                let mut guard = state.lock().await;
                let state = &mut *guard;
                match &result {
                    Ok(value) => {
                        let now = clock.now();
                        state
                            .entries
                            .insert(key.clone(), CacheEntry::new(value.clone(), now, ttl));
                    }
                    Err(err) => {
                        metrics.record_fetch_failure();
                        debug!(key = %key, error = %err, "Fetch failed; keeping any previous value");
                        if let Some(entry) = state.entries.get_mut(&key) {
                            entry.last_error = Some(err.clone());
                        }
                    }
                }
                state.inflight.remove(&key);
            }
            tx.send_replace(Some(result));
        });
    }

    /// Await a fetch owned by another caller and serve its outcome.
    async fn join_inflight(&self, key: &str, mut rx: InflightRx<V>) -> CacheResult<CacheRead<V>> {
        let result = loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                break result;
            }
            if rx.changed().await.is_err() {
                break Err(FetchError::new("fetch ended without publishing a result"));
            }
        };

        match result {
            Ok(value) => {
                let guard = self.state.lock().await;
                match guard.entries.get(key) {
                    Some(entry) => Ok(CacheRead::fetched(entry.value.clone(), entry.fetched_at)),
                    // Entry removed between publish and here; serve the
                    // joined value directly.
                    None => Ok(CacheRead::fetched(value, self.clock.now())),
                }
            }
            Err(err) => {
                let guard = self.state.lock().await;
                match guard.entries.get(key) {
                    Some(entry) => Ok(CacheRead::stale_with_error(
                        entry.value.clone(),
                        entry.fetched_at,
                        err,
                    )),
                    None => Err(CacheError::Fetch {
                        key: key.to_string(),
                        source: err,
                    }),
                }
            }
        }
    }
}

impl<V> Clone for ReadThroughCache<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
