//! JSON-file queue store.
//!
//! Persists the unflushed queue as a single JSON document, the offline
//! fallback for kiosk-style deployments. The queue is small (bounded by the
//! relay's size cap) so the whole document is rewritten on every save;
//! writes go through a sibling temp file and a rename so a crash mid-write
//! leaves the previous snapshot intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use marquee_core::{QueuedEvent, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{QueueStore, StoreResult};

/// Queue store backed by a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileQueueStore {
    path: PathBuf,
}

impl JsonFileQueueStore {
    /// Create a store persisting to the given path.
    ///
    /// The file is created lazily on the first `save`; the parent directory
    /// must already exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, err: std::io::Error) -> StoreError {
        StoreError::Io {
            location: self.location(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl<P> QueueStore<P> for JsonFileQueueStore
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> StoreResult<Option<Vec<QueuedEvent<P>>>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };

        let events: Vec<QueuedEvent<P>> =
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
                location: self.location(),
                reason: err.to_string(),
            })?;

        debug!(path = %self.location(), count = events.len(), "Loaded persisted queue");
        Ok(Some(events))
    }

    async fn save(&self, events: &[QueuedEvent<P>]) -> StoreResult<()> {
        let bytes = serde_json::to_vec(events).map_err(|err| StoreError::Io {
            location: self.location(),
            reason: err.to_string(),
        })?;

        let temp = self.temp_path();
        std::fs::write(&temp, &bytes).map_err(|err| self.io_error(err))?;
        std::fs::rename(&temp, &self.path).map_err(|err| self.io_error(err))?;

        debug!(path = %self.location(), count = events.len(), "Persisted queue snapshot");
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}
