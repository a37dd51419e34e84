//! Marquee Core - shared data types
//!
//! Pure data structures with no behavior beyond construction and
//! classification. All other crates depend on this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    CacheError, ConfigError, FetchError, MarqueeError, MarqueeResult, RelayError, StoreError,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Session/correlation identifier using UUIDv7 for timestamp-sortable IDs.
pub type SessionId = Uuid;

/// Generate a new UUIDv7 SessionId (timestamp-sortable).
pub fn new_session_id() -> SessionId {
    Uuid::now_v7()
}

// ============================================================================
// EVENT KIND
// ============================================================================

/// Tag identifying the shape of a queued event.
///
/// This is an open set: the relay treats kinds as opaque strings and new
/// kinds require no code changes. Dotted names (`"playback.started"`) are
/// conventional but not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(String);

impl EventKind {
    /// Create a new event kind from a tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Get the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// QUEUED EVENT
// ============================================================================

/// A single telemetry event captured by the relay.
///
/// `recorded_at` is the capture time, not the delivery time, and never
/// changes after creation. `duration_secs` is set only for events produced
/// by closing a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent<P> {
    pub kind: EventKind,
    pub payload: P,
    pub recorded_at: Timestamp,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

impl<P> QueuedEvent<P> {
    /// Create a discrete event captured at the given instant.
    pub fn new(
        kind: impl Into<EventKind>,
        payload: P,
        recorded_at: Timestamp,
        session_id: SessionId,
    ) -> Self {
        Self {
            kind: kind.into(),
            payload,
            recorded_at,
            session_id,
            duration_secs: None,
        }
    }

    /// Attach a span duration (seconds) to this event.
    pub fn with_duration(mut self, duration_secs: i64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
