//! Marquee Test Utilities
//!
//! Centralized test infrastructure for the Marquee workspace:
//! - Mock delivery sinks and failing stores
//! - Proptest generators for event types
//! - Payload fixtures for common scenarios

// Re-export the in-memory store from its source crate
pub use marquee_store::MemoryQueueStore;

// Re-export core types for convenience
pub use marquee_core::{
    new_session_id, CacheError, Clock, ConfigError, EventKind, FetchError, ManualClock,
    MarqueeError, MarqueeResult, QueuedEvent, RelayError, SessionId, StoreError, SystemClock,
    Timestamp,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use marquee_relay::DeliverySink;
use marquee_store::{QueueStore, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

// ============================================================================
// MOCK DELIVERY SINKS
// ============================================================================

/// Delivery sink that records every batch it accepts.
///
/// Failure injection is a toggle: while failing, `deliver` rejects batches
/// without recording them, matching a sink whose remote endpoint is down.
#[derive(Debug, Default)]
pub struct RecordingSink<P> {
    batches: Mutex<Vec<Vec<QueuedEvent<P>>>>,
    failing: AtomicBool,
    detached_calls: AtomicUsize,
}

impl<P: Clone> RecordingSink<P> {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            detached_calls: AtomicUsize::new(0),
        }
    }

    /// Toggle failure injection.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of batches accepted so far.
    pub async fn batch_count(&self) -> usize {
        self.batches.lock().await.len()
    }

    /// All accepted events, flattened in delivery order.
    pub async fn delivered(&self) -> Vec<QueuedEvent<P>> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }

    /// Number of fire-and-forget deliveries attempted.
    pub fn detached_calls(&self) -> usize {
        self.detached_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P> DeliverySink<P> for RecordingSink<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn deliver(&self, batch: &[QueuedEvent<P>]) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::DeliveryFailed {
                count: batch.len(),
                reason: "sink endpoint unavailable".to_string(),
            });
        }
        self.batches.lock().await.push(batch.to_vec());
        Ok(())
    }

    async fn deliver_detached(&self, batch: Vec<QueuedEvent<P>>) {
        self.detached_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.deliver(&batch).await;
    }
}

/// Delivery sink that rejects every batch.
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivery attempts rejected.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P> DeliverySink<P> for FailingSink
where
    P: Send + Sync + 'static,
{
    async fn deliver(&self, batch: &[QueuedEvent<P>]) -> Result<(), RelayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(RelayError::DeliveryFailed {
            count: batch.len(),
            reason: "sink always fails".to_string(),
        })
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Queue store whose every operation fails, for degraded-persistence tests.
#[derive(Debug, Default)]
pub struct FailingQueueStore {
    operations: AtomicUsize,
}

impl FailingQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations attempted against this store.
    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> StoreResult<T> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable {
            reason: "storage backend offline".to_string(),
        })
    }
}

#[async_trait]
impl<P> QueueStore<P> for FailingQueueStore
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> StoreResult<Option<Vec<QueuedEvent<P>>>> {
        self.fail()
    }

    async fn save(&self, _events: &[QueuedEvent<P>]) -> StoreResult<()> {
        self.fail()
    }

    async fn clear(&self) -> StoreResult<()> {
        self.fail()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// JSON payload shaped like a playback report, keyed by a marker for
/// order assertions.
pub fn playback_payload(marker: u64) -> serde_json::Value {
    serde_json::json!({
        "media": format!("media-{marker}.mp4"),
        "marker": marker,
    })
}

/// Extract the order markers from a slice of delivered events.
pub fn markers(events: &[QueuedEvent<serde_json::Value>]) -> Vec<Option<u64>> {
    events.iter().map(|e| e.payload["marker"].as_u64()).collect()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use proptest::prelude::*;

    pub fn arb_event_kind() -> impl Strategy<Value = EventKind> {
        "[a-z]{1,10}(\\.[a-z]{1,10}){0,2}".prop_map(EventKind::new)
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-01-01 through roughly 2033
        (1_577_836_800i64..2_000_000_000i64).prop_map(|secs| {
            Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
        })
    }

    pub fn arb_queued_event() -> impl Strategy<Value = QueuedEvent<serde_json::Value>> {
        (
            arb_event_kind(),
            any::<u32>(),
            arb_timestamp(),
            proptest::option::of(0i64..86_400),
        )
            .prop_map(|(kind, marker, recorded_at, duration)| {
                let event = QueuedEvent::new(
                    kind,
                    serde_json::json!({ "marker": marker }),
                    recorded_at,
                    new_session_id(),
                );
                match duration {
                    Some(d) => event.with_duration(d),
                    None => event,
                }
            })
    }
}
