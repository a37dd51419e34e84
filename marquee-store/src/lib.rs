//! Durable queue storage for the Marquee event relay.
//!
//! The relay persists its unflushed queue here while offline and reloads it
//! on startup. Storage is a best-effort side channel: every implementation
//! may fail, and callers must degrade to memory-only operation rather than
//! propagate the failure to tracking call sites.

use async_trait::async_trait;
use marquee_core::QueuedEvent;
use serde::de::DeserializeOwned;
use serde::Serialize;

mod json_file;

pub use json_file::JsonFileQueueStore;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, marquee_core::StoreError>;

/// Durable fallback storage for unflushed events.
///
/// Contract:
/// - `load` returns `Ok(None)` when nothing was persisted; an empty vec and
///   `None` are equivalent to callers.
/// - `save` replaces the persisted snapshot wholesale.
/// - `clear` removes the snapshot; clearing an empty store is not an error.
///
/// Implementations must tolerate concurrent use from multiple tasks.
#[async_trait]
pub trait QueueStore<P>: Send + Sync
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Load the persisted queue from a prior run, if any.
    async fn load(&self) -> StoreResult<Option<Vec<QueuedEvent<P>>>>;

    /// Persist the current queue, replacing any previous snapshot.
    async fn save(&self, events: &[QueuedEvent<P>]) -> StoreResult<()>;

    /// Remove the persisted snapshot after a confirmed flush.
    async fn clear(&self) -> StoreResult<()>;
}

/// In-memory queue store.
///
/// Reference implementation of the `QueueStore` contract; also used by
/// tests that need to observe what the relay persisted.
#[derive(Debug, Default)]
pub struct MemoryQueueStore<P> {
    snapshot: tokio::sync::RwLock<Option<Vec<QueuedEvent<P>>>>,
}

impl<P> MemoryQueueStore<P> {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            snapshot: tokio::sync::RwLock::new(None),
        }
    }
}

impl<P: Clone> MemoryQueueStore<P> {
    /// Peek at the persisted snapshot without consuming it.
    pub async fn snapshot(&self) -> Option<Vec<QueuedEvent<P>>> {
        self.snapshot.read().await.clone()
    }
}

#[async_trait]
impl<P> QueueStore<P> for MemoryQueueStore<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> StoreResult<Option<Vec<QueuedEvent<P>>>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, events: &[QueuedEvent<P>]) -> StoreResult<()> {
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Some(events.to_vec());
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut snapshot = self.snapshot.write().await;
        *snapshot = None;
        Ok(())
    }
}
