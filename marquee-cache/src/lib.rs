//! Stale-while-revalidate read-through cache.
//!
//! Application code asks the cache for a value by key and supplies the fetch
//! that produces it. Fresh entries are served directly; stale-but-unexpired
//! entries are served immediately while a single background refresh runs;
//! absent or expired entries block the caller on one deduplicated fetch.
//! Failed fetches never evict cached data.

mod cache;
mod entry;
mod keyspace;

pub use cache::{CacheConfig, CacheMetricsSnapshot, CacheStats, GetOptions, ReadThroughCache};
pub use entry::{CacheEntry, CacheRead, Freshness, ReadSource};
pub use keyspace::Keyspace;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, marquee_core::CacheError>;
