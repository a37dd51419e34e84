//! Delivery and connectivity seams.

use async_trait::async_trait;
use marquee_core::{QueuedEvent, RelayError};
use tokio::sync::watch;

/// Remote sink accepting ordered batches of events.
///
/// The relay treats the sink as opaque: timeouts and transport concerns
/// belong to the implementation, not the queue.
#[async_trait]
pub trait DeliverySink<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Deliver a batch, confirming success or signalling failure.
    ///
    /// Order within the batch is meaningful and must be preserved by the
    /// transport.
    async fn deliver(&self, batch: &[QueuedEvent<P>]) -> Result<(), RelayError>;

    /// Best-effort delivery with no confirmation, used at teardown.
    ///
    /// Implementations with a fire-and-forget transport (a beacon-style
    /// primitive) should override this; the default awaits `deliver` and
    /// drops the outcome.
    async fn deliver_detached(&self, batch: Vec<QueuedEvent<P>>) {
        let _ = self.deliver(&batch).await;
    }
}

/// Source of online/offline transitions.
///
/// `subscribe` yields a receiver whose value is true while online. A relay
/// constructed without a source assumes it is always online.
pub trait ConnectivitySource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by an explicit toggle.
///
/// The in-crate adapter for runtimes that report connectivity through
/// callbacks: wire the callback to `set_online`.
#[derive(Debug)]
pub struct ToggleConnectivity {
    tx: watch::Sender<bool>,
}

impl ToggleConnectivity {
    /// Create a toggle starting in the given state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Report a connectivity transition.
    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    /// Current state of the toggle.
    pub fn is_online(&self) -> bool {
        *self.tx.subscribe().borrow()
    }
}

impl ConnectivitySource for ToggleConnectivity {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
