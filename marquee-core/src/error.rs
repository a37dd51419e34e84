//! Error types for Marquee operations

use std::time::Duration;
use thiserror::Error;

/// Failure reported by an injected fetch function.
///
/// The cache treats fetch functions as opaque, so this carries only a
/// human-readable reason. It is cheap to clone so every caller waiting on
/// a deduplicated fetch can observe the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetch failed: {reason}")]
pub struct FetchError {
    pub reason: String,
}

impl FetchError {
    /// Create a fetch error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Read-through cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch for key '{key}' failed: {source}")]
    Fetch {
        key: String,
        #[source]
        source: FetchError,
    },

    #[error("No value available for key '{key}' and fetching is disabled")]
    Disabled { key: String },
}

/// Event relay errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Delivery of {count} events failed: {reason}")]
    DeliveryFailed { count: usize, reason: String },

    #[error("Relay is stopped")]
    Stopped,
}

/// Durable queue storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Persisted queue at {location} is corrupt: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("I/O failure on {location}: {reason}")]
    Io { location: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Duration for {field} must be positive, got {value:?}")]
    ZeroDuration { field: String, value: Duration },
}

/// Master error type for all Marquee errors.
#[derive(Debug, Clone, Error)]
pub enum MarqueeError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Marquee operations.
pub type MarqueeResult<T> = Result<T, MarqueeError>;

// =============================================================================
// TESTS
// =============================================================================
