//! Event queue and offline relay.
//!
//! Collects discrete events and interval spans into an in-memory queue,
//! delivers them in ordered batches through a [`DeliverySink`], and falls
//! back to durable persistence while offline. Delivery is at-least-once:
//! failed batches are re-queued ahead of newer events, and the durable
//! backup is only cleared after a confirmed flush.

mod relay;
mod sink;
mod span;

pub use relay::{EventRelay, FlushOutcome, RelayConfig, RelayMetricsSnapshot};
pub use sink::{ConnectivitySource, DeliverySink, ToggleConnectivity};
pub use span::ActiveSpan;
