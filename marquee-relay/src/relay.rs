//! Bounded event queue with periodic flush and offline persistence.
//!
//! Events accumulate in memory and are delivered in batches: on a timer, on
//! reaching the queue-size cap, on connectivity being restored, or on
//! explicit request. A flush swaps the queue out atomically, so events
//! tracked while a delivery is in flight are never duplicated and never
//! lost. Failed batches are re-queued at the head; delivery is
//! at-least-once with retried events placed ahead of newer ones.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marquee_core::{
    new_session_id, Clock, ConfigError, EventKind, QueuedEvent, RelayError, SessionId, Timestamp,
};
use marquee_store::QueueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::sink::{ConnectivitySource, DeliverySink};
use crate::span::ActiveSpan;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the event relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the background task flushes the queue.
    pub flush_interval: Duration,
    /// Queue length that forces an immediate flush on track.
    pub max_queue_size: usize,
    /// Spans shorter than this many seconds are discarded at close.
    pub min_span_secs: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            max_queue_size: 50,
            min_span_secs: 1,
        }
    }
}

impl RelayConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the periodic flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the queue length that forces an immediate flush.
    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    /// Set the minimum span duration worth recording.
    pub fn with_min_span_secs(mut self, secs: i64) -> Self {
        self.min_span_secs = secs;
        self
    }

    /// Configuration for development: fast flushes, every span recorded.
    pub fn development() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            max_queue_size: 10,
            min_span_secs: 0,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "flush_interval".to_string(),
                value: self.flush_interval,
            });
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_queue_size".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.min_span_secs < 0 {
            return Err(ConfigError::InvalidValue {
                field: "min_span_secs".to_string(),
                value: self.min_span_secs.to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Atomic counters for relay activity.
#[derive(Debug, Default)]
struct RelayMetrics {
    events_tracked: AtomicU64,
    batches_delivered: AtomicU64,
    events_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    events_recovered: AtomicU64,
    persistence_failures: AtomicU64,
    spans_discarded: AtomicU64,
}

impl RelayMetrics {
    fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            events_tracked: self.events_tracked.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            events_recovered: self.events_recovered.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            spans_discarded: self.spans_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayMetricsSnapshot {
    pub events_tracked: u64,
    pub batches_delivered: u64,
    pub events_delivered: u64,
    pub delivery_failures: u64,
    pub events_recovered: u64,
    pub persistence_failures: u64,
    pub spans_discarded: u64,
}

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to deliver.
    Empty,
    /// The batch was delivered; carries the event count.
    Delivered(usize),
    /// Offline; the queue was persisted instead of delivered.
    Offline,
    /// Delivery failed; the batch was re-queued at the head.
    Requeued(usize),
}

// ============================================================================
// RELAY
// ============================================================================

struct RelayState<P> {
    queue: Vec<QueuedEvent<P>>,
    open_span: Option<ActiveSpan<P>>,
    stopped: bool,
}

struct RelayShared<P> {
    config: RelayConfig,
    sink: Arc<dyn DeliverySink<P>>,
    store: Arc<dyn QueueStore<P>>,
    clock: Arc<dyn Clock>,
    session_id: SessionId,
    state: Mutex<RelayState<P>>,
    /// Serializes flush attempts so a retried batch cannot be overtaken.
    flush_lock: Mutex<()>,
    online_rx: watch::Receiver<bool>,
    /// Keeps the fallback channel alive when no connectivity source exists.
    _online_tx: Option<watch::Sender<bool>>,
    shutdown_tx: watch::Sender<bool>,
    metrics: RelayMetrics,
}

/// Event queue and offline relay.
///
/// Cheaply cloneable handle; all clones share the queue and the background
/// flush task. Dropping handles does not stop the task; call
/// [`EventRelay::stop`] at teardown.
pub struct EventRelay<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    shared: Arc<RelayShared<P>>,
}

impl<P> EventRelay<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start a relay: assign a session, recover any persisted queue, spawn
    /// the periodic flush task, and watch connectivity transitions.
    ///
    /// Fails fast on an invalid configuration. A load failure from the
    /// store is not fatal; the relay starts with an empty queue.
    pub async fn start(
        config: RelayConfig,
        sink: Arc<dyn DeliverySink<P>>,
        store: Arc<dyn QueueStore<P>>,
        connectivity: Option<&dyn ConnectivitySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let session_id = new_session_id();

        let (online_rx, online_tx) = match connectivity {
            Some(source) => (source.subscribe(), None),
            None => {
                let (tx, rx) = watch::channel(true);
                (rx, Some(tx))
            }
        };

        let recovered = match store.load().await {
            Ok(Some(events)) => events,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "Failed to load persisted queue; starting empty");
                Vec::new()
            }
        };
        let recovered_count = recovered.len();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(RelayShared {
            config,
            sink,
            store,
            clock,
            session_id,
            state: Mutex::new(RelayState {
                queue: recovered,
                open_span: None,
                stopped: false,
            }),
            flush_lock: Mutex::new(()),
            online_rx,
            _online_tx: online_tx,
            shutdown_tx,
            metrics: RelayMetrics::default(),
        });
        shared
            .metrics
            .events_recovered
            .fetch_add(recovered_count as u64, Ordering::Relaxed);

        info!(
            session_id = %session_id,
            recovered = recovered_count,
            flush_interval_secs = shared.config.flush_interval.as_secs(),
            "Event relay started"
        );

        let relay = Self { shared };
        relay.spawn_flush_task(shutdown_rx);
        Ok(relay)
    }

    /// The session identifier assigned at start.
    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// The relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// True while the connectivity signal reports online.
    pub fn is_online(&self) -> bool {
        *self.shared.online_rx.borrow()
    }

    /// Snapshot the activity counters.
    pub fn metrics(&self) -> RelayMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Number of events currently queued.
    pub async fn queue_len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    /// Append a discrete event recorded at the current clock time.
    ///
    /// Reaching `max_queue_size` forces an immediate flush before this call
    /// returns; backpressure is a synchronous drain, never a drop.
    pub async fn track_event(
        &self,
        kind: impl Into<EventKind>,
        payload: P,
    ) -> Result<(), RelayError> {
        let (snapshot, force_flush) = {
            let mut guard = self.shared.state.lock().await;
            if guard.stopped {
                return Err(RelayError::Stopped);
            }
            let event = QueuedEvent::new(
                kind,
                payload,
                self.shared.clock.now(),
                self.shared.session_id,
            );
            guard.queue.push(event);
            self.shared.metrics.events_tracked.fetch_add(1, Ordering::Relaxed);
            self.offline_snapshot_and_cap(&guard)
        };

        if let Some(events) = snapshot {
            self.persist(&events).await;
        }
        if force_flush {
            debug!(max = self.shared.config.max_queue_size, "Queue reached cap; forcing flush");
            self.flush().await;
        }
        Ok(())
    }

    /// Open a span, implicitly closing and enqueueing any open one first.
    pub async fn start_span(
        &self,
        kind: impl Into<EventKind>,
        payload: P,
    ) -> Result<(), RelayError> {
        let (snapshot, force_flush) = {
            let mut guard = self.shared.state.lock().await;
            if guard.stopped {
                return Err(RelayError::Stopped);
            }
            let now = self.shared.clock.now();
            if let Some(open) = guard.open_span.take() {
                self.close_span_into_queue(&mut guard, open, now);
            }
            guard.open_span = Some(ActiveSpan::open(kind, payload, now));
            self.offline_snapshot_and_cap(&guard)
        };

        if let Some(events) = snapshot {
            self.persist(&events).await;
        }
        if force_flush {
            self.flush().await;
        }
        Ok(())
    }

    /// Close the open span, if any, returning its rounded duration.
    ///
    /// Spans shorter than the configured minimum are discarded rather than
    /// enqueued; the duration is returned either way. With no open span
    /// this is a no-op returning `None`.
    pub async fn end_span(&self) -> Result<Option<i64>, RelayError> {
        let (duration, snapshot, force_flush) = {
            let mut guard = self.shared.state.lock().await;
            if guard.stopped {
                return Err(RelayError::Stopped);
            }
            match guard.open_span.take() {
                None => (None, None, false),
                Some(span) => {
                    let now = self.shared.clock.now();
                    let duration = self.close_span_into_queue(&mut guard, span, now);
                    let (snapshot, force) = self.offline_snapshot_and_cap(&guard);
                    (Some(duration), snapshot, force)
                }
            }
        };

        if let Some(events) = snapshot {
            self.persist(&events).await;
        }
        if force_flush {
            self.flush().await;
        }
        Ok(duration)
    }

    /// Flush the queue.
    ///
    /// Offline: persist the queue and return without attempting delivery.
    /// Online: swap the queue out atomically and deliver it; on success
    /// clear the durable backup, on failure re-queue the batch at the head
    /// (preserving order) and persist.
    pub async fn flush(&self) -> FlushOutcome {
        let _flush_guard = self.shared.flush_lock.lock().await;

        if !self.is_online() {
            let snapshot = self.shared.state.lock().await.queue.clone();
            if !snapshot.is_empty() {
                self.persist(&snapshot).await;
            }
            return FlushOutcome::Offline;
        }

        let batch = {
            let mut guard = self.shared.state.lock().await;
            mem::take(&mut guard.queue)
        };
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        match self.shared.sink.deliver(&batch).await {
            Ok(()) => {
                let count = batch.len();
                self.shared.metrics.batches_delivered.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .metrics
                    .events_delivered
                    .fetch_add(count as u64, Ordering::Relaxed);
                if let Err(err) = self.shared.store.clear().await {
                    self.shared
                        .metrics
                        .persistence_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "Failed to clear persisted queue after delivery");
                }
                debug!(count, "Delivered event batch");
                FlushOutcome::Delivered(count)
            }
            Err(err) => {
                self.shared
                    .metrics
                    .delivery_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, count = batch.len(), "Delivery failed; re-queueing batch");
                let snapshot = {
                    let mut guard = self.shared.state.lock().await;
                    let mut requeued = batch;
                    requeued.extend(guard.queue.drain(..));
                    guard.queue = requeued;
                    guard.queue.clone()
                };
                let count = snapshot.len();
                self.persist(&snapshot).await;
                FlushOutcome::Requeued(count)
            }
        }
    }

    /// Stop the relay: close any open span, stop the background task, and
    /// perform a final best-effort flush.
    ///
    /// The teardown flush goes through `deliver_detached` with no
    /// confirmation, so the durable backup is left in place; an unconfirmed
    /// batch is replayed by the next session rather than lost.
    pub async fn stop(&self) {
        {
            let mut guard = self.shared.state.lock().await;
            if guard.stopped {
                return;
            }
            guard.stopped = true;
            if let Some(span) = guard.open_span.take() {
                let now = self.shared.clock.now();
                self.close_span_into_queue(&mut guard, span, now);
            }
        }

        let _ = self.shared.shutdown_tx.send(true);

        if self.is_online() {
            let batch = {
                let mut guard = self.shared.state.lock().await;
                mem::take(&mut guard.queue)
            };
            if !batch.is_empty() {
                debug!(count = batch.len(), "Teardown flush via detached delivery");
                self.shared.sink.deliver_detached(batch).await;
            }
        } else {
            let snapshot = self.shared.state.lock().await.queue.clone();
            if !snapshot.is_empty() {
                self.persist(&snapshot).await;
            }
        }

        info!(session_id = %self.shared.session_id, "Event relay stopped");
    }

    /// Queue snapshot to persist when offline, plus whether the cap forces
    /// a flush. Called with the state lock held.
    fn offline_snapshot_and_cap(
        &self,
        state: &RelayState<P>,
    ) -> (Option<Vec<QueuedEvent<P>>>, bool) {
        let force = state.queue.len() >= self.shared.config.max_queue_size;
        let snapshot =
            (!self.is_online() && !state.queue.is_empty()).then(|| state.queue.clone());
        (snapshot, force)
    }

    /// Close a span into the queue, applying the minimum-duration filter.
    /// Returns the rounded duration. Called with the state lock held.
    fn close_span_into_queue(
        &self,
        state: &mut RelayState<P>,
        span: ActiveSpan<P>,
        now: Timestamp,
    ) -> i64 {
        let elapsed_ms = span.elapsed_ms(now);
        let duration = span.duration_secs(now);
        if elapsed_ms < self.shared.config.min_span_secs * 1000 {
            self.shared.metrics.spans_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %span.kind(), elapsed_ms, "Discarding span below minimum duration");
        } else {
            state
                .queue
                .push(span.into_event(now, self.shared.session_id));
        }
        duration
    }

    async fn persist(&self, events: &[QueuedEvent<P>]) {
        if let Err(err) = self.shared.store.save(events).await {
            self.shared
                .metrics
                .persistence_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, count = events.len(), "Failed to persist queue; continuing in memory");
        }
    }

    async fn handle_connectivity(&self, online: bool) {
        if online {
            info!("Connectivity restored; flushing accumulated events");
            self.flush().await;
        } else {
            let snapshot = {
                let mut guard = self.shared.state.lock().await;
                if let Some(span) = guard.open_span.take() {
                    let now = self.shared.clock.now();
                    self.close_span_into_queue(&mut guard, span, now);
                }
                guard.queue.clone()
            };
            info!(queued = snapshot.len(), "Connectivity lost; persisting queue");
            if !snapshot.is_empty() {
                self.persist(&snapshot).await;
            }
        }
    }

    fn spawn_flush_task(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let relay = self.clone();
        let mut online_rx = self.shared.online_rx.clone();
        tokio::spawn(async move {
            let mut flush_interval = interval(relay.shared.config.flush_interval);
            flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; consume it so the first
            // periodic flush happens a full interval after start.
            flush_interval.tick().await;

            let mut connectivity_live = true;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Relay flush task shutting down");
                            break;
                        }
                    }

                    _ = flush_interval.tick() => {
                        relay.flush().await;
                    }

                    changed = online_rx.changed(), if connectivity_live => {
                        match changed {
                            Ok(()) => {
                                let online = *online_rx.borrow_and_update();
                                relay.handle_connectivity(online).await;
                            }
                            // Source dropped; stay in the last known state.
                            Err(_) => connectivity_live = false,
                        }
                    }
                }
            }
        });
    }
}

impl<P> Clone for EventRelay<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ToggleConnectivity;
    use async_trait::async_trait;
    use marquee_core::{ManualClock, StoreError};
    use marquee_store::{MemoryQueueStore, StoreResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    type Payload = serde_json::Value;

    #[derive(Default)]
    struct TestSink {
        batches: Mutex<Vec<Vec<QueuedEvent<Payload>>>>,
        fail: AtomicBool,
        detached_calls: AtomicUsize,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }

        async fn delivered(&self) -> Vec<QueuedEvent<Payload>> {
            self.batches.lock().await.iter().flatten().cloned().collect()
        }

        async fn batch_count(&self) -> usize {
            self.batches.lock().await.len()
        }
    }

    #[async_trait]
    impl DeliverySink<Payload> for TestSink {
        async fn deliver(&self, batch: &[QueuedEvent<Payload>]) -> Result<(), RelayError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RelayError::DeliveryFailed {
                    count: batch.len(),
                    reason: "injected failure".to_string(),
                });
            }
            self.batches.lock().await.push(batch.to_vec());
            Ok(())
        }

        async fn deliver_detached(&self, batch: Vec<QueuedEvent<Payload>>) {
            self.detached_calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.deliver(&batch).await;
        }
    }

    struct FailingStore;

    #[async_trait]
    impl QueueStore<Payload> for FailingStore {
        async fn load(&self) -> StoreResult<Option<Vec<QueuedEvent<Payload>>>> {
            Err(StoreError::Unavailable {
                reason: "disk full".to_string(),
            })
        }

        async fn save(&self, _events: &[QueuedEvent<Payload>]) -> StoreResult<()> {
            Err(StoreError::Unavailable {
                reason: "disk full".to_string(),
            })
        }

        async fn clear(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable {
                reason: "disk full".to_string(),
            })
        }
    }

    fn quiet_config() -> RelayConfig {
        // Long interval so the periodic timer never fires during a test.
        RelayConfig::new()
            .with_flush_interval(Duration::from_secs(600))
            .with_max_queue_size(100)
    }

    async fn start_relay(
        config: RelayConfig,
        sink: &Arc<TestSink>,
        store: &Arc<MemoryQueueStore<Payload>>,
        connectivity: Option<&dyn ConnectivitySource>,
        clock: &Arc<ManualClock>,
    ) -> EventRelay<Payload> {
        EventRelay::start(
            config,
            Arc::clone(sink) as Arc<dyn DeliverySink<Payload>>,
            Arc::clone(store) as Arc<dyn QueueStore<Payload>>,
            connectivity,
            Arc::clone(clock) as Arc<dyn Clock>,
        )
        .await
        .expect("relay should start")
    }

    fn payload(n: u64) -> Payload {
        json!({ "n": n })
    }

    /// Spin the runtime until `cond` holds or the budget runs out.
    async fn wait_until<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            // Sleep rather than yield so the runtime parks and drives its
            // timer; the flush task's startup tick never fires otherwise.
            tokio::time::sleep(Duration::from_millis(1)).await;
            if cond().await {
                return;
            }
        }
        panic!("condition did not hold in time");
    }

    #[tokio::test]
    async fn test_track_and_flush_preserves_order() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        for n in 0..3 {
            relay
                .track_event("playback.started", payload(n))
                .await
                .expect("track should succeed");
        }
        assert_eq!(relay.queue_len().await, 3);

        let outcome = relay.flush().await;
        assert_eq!(outcome, FlushOutcome::Delivered(3));
        assert_eq!(relay.queue_len().await, 0);

        let delivered = sink.delivered().await;
        let markers: Vec<_> = delivered.iter().map(|e| e.payload["n"].as_u64()).collect();
        assert_eq!(markers, vec![Some(0), Some(1), Some(2)]);
        for event in &delivered {
            assert_eq!(event.session_id, relay.session_id());
        }
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_noop() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        assert_eq!(relay.flush().await, FlushOutcome::Empty);
        assert_eq!(sink.batch_count().await, 0);
    }

    #[tokio::test]
    async fn test_reaching_cap_forces_flush() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let config = quiet_config().with_max_queue_size(3);
        let relay = start_relay(config, &sink, &store, None, &clock).await;

        for n in 0..3 {
            relay
                .track_event("screen.heartbeat", payload(n))
                .await
                .expect("track should succeed");
        }

        // The third track crossed the cap and drained the queue inline,
        // without a timer tick.
        assert_eq!(relay.queue_len().await, 0);
        assert_eq!(sink.batch_count().await, 1);
        assert_eq!(sink.delivered().await.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_then_redelivers_in_order() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        sink.set_failing(true);
        for n in 0..3 {
            relay
                .track_event("playback.started", payload(n))
                .await
                .expect("track should succeed");
        }
        assert_eq!(relay.flush().await, FlushOutcome::Requeued(3));
        assert_eq!(relay.queue_len().await, 3);
        assert_eq!(relay.metrics().delivery_failures, 1);

        // The failed batch was also persisted.
        let persisted = store.snapshot().await.expect("queue should be persisted");
        assert_eq!(persisted.len(), 3);

        sink.set_failing(false);
        relay
            .track_event("playback.started", payload(3))
            .await
            .expect("track should succeed");

        assert_eq!(relay.flush().await, FlushOutcome::Delivered(4));
        let markers: Vec<_> = sink
            .delivered()
            .await
            .iter()
            .map(|e| e.payload["n"].as_u64())
            .collect();
        assert_eq!(markers, vec![Some(0), Some(1), Some(2), Some(3)]);

        // Confirmed delivery clears the durable backup.
        assert!(store.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_flush_persists_without_delivery() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let toggle = ToggleConnectivity::new(false);
        let relay = start_relay(quiet_config(), &sink, &store, Some(&toggle), &clock).await;

        relay
            .track_event("screen.online", payload(1))
            .await
            .expect("track should succeed");

        assert_eq!(relay.flush().await, FlushOutcome::Offline);
        assert_eq!(sink.batch_count().await, 0);
        assert_eq!(relay.queue_len().await, 1);
        assert!(store.snapshot().await.is_some());
    }

    #[tokio::test]
    async fn test_track_while_offline_persists_each_event() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let toggle = ToggleConnectivity::new(false);
        let relay = start_relay(quiet_config(), &sink, &store, Some(&toggle), &clock).await;

        relay
            .track_event("screen.online", payload(1))
            .await
            .expect("track should succeed");
        let persisted = store.snapshot().await.expect("queue should be persisted");
        assert_eq!(persisted.len(), 1);

        relay
            .track_event("screen.online", payload(2))
            .await
            .expect("track should succeed");
        let persisted = store.snapshot().await.expect("queue should be persisted");
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_recovers_persisted_events_ahead_of_new() {
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());

        // First session goes offline and leaves two events behind.
        {
            let sink = TestSink::new();
            let toggle = ToggleConnectivity::new(false);
            let relay = start_relay(quiet_config(), &sink, &store, Some(&toggle), &clock).await;
            relay
                .track_event("playback.started", payload(1))
                .await
                .expect("track should succeed");
            relay
                .track_event("playback.started", payload(2))
                .await
                .expect("track should succeed");
            relay.stop().await;
        }

        // Second session recovers them ahead of anything new.
        let sink = TestSink::new();
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;
        assert_eq!(relay.queue_len().await, 2);
        assert_eq!(relay.metrics().events_recovered, 2);

        relay
            .track_event("playback.started", payload(3))
            .await
            .expect("track should succeed");
        assert_eq!(relay.flush().await, FlushOutcome::Delivered(3));

        let markers: Vec<_> = sink
            .delivered()
            .await
            .iter()
            .map(|e| e.payload["n"].as_u64())
            .collect();
        assert_eq!(markers, vec![Some(1), Some(2), Some(3)]);
        assert!(store.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_online_transition_triggers_flush() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let toggle = ToggleConnectivity::new(false);
        let relay = start_relay(quiet_config(), &sink, &store, Some(&toggle), &clock).await;

        relay
            .track_event("screen.online", payload(1))
            .await
            .expect("track should succeed");
        relay
            .track_event("screen.online", payload(2))
            .await
            .expect("track should succeed");

        toggle.set_online(true);
        wait_until(|| async { sink.batch_count().await == 1 }).await;
        assert_eq!(sink.delivered().await.len(), 2);
        assert_eq!(relay.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_offline_transition_closes_span_and_persists() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let toggle = ToggleConnectivity::new(true);
        let relay = start_relay(quiet_config(), &sink, &store, Some(&toggle), &clock).await;

        relay
            .start_span("playback.span", payload(1))
            .await
            .expect("start_span should succeed");
        clock.advance(Duration::from_secs(5));

        toggle.set_online(false);
        wait_until(|| async { store.snapshot().await.is_some() }).await;

        let persisted = store.snapshot().await.expect("queue should be persisted");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].duration_secs, Some(5));
        assert!(!relay.is_online());
    }

    #[tokio::test]
    async fn test_span_below_minimum_is_discarded() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        relay
            .start_span("playback.span", payload(1))
            .await
            .expect("start_span should succeed");
        clock.advance(Duration::from_millis(400));
        let duration = relay.end_span().await.expect("end_span should succeed");

        assert_eq!(duration, Some(0));
        assert_eq!(relay.queue_len().await, 0);
        assert_eq!(relay.metrics().spans_discarded, 1);
    }

    #[tokio::test]
    async fn test_span_duration_rounds_to_nearest_second() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        relay
            .start_span("playback.span", payload(1))
            .await
            .expect("start_span should succeed");
        clock.advance(Duration::from_millis(2400));
        let duration = relay.end_span().await.expect("end_span should succeed");

        assert_eq!(duration, Some(2));
        assert_eq!(relay.queue_len().await, 1);

        relay.flush().await;
        let delivered = sink.delivered().await;
        assert_eq!(delivered[0].duration_secs, Some(2));
    }

    #[tokio::test]
    async fn test_start_span_closes_previous() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        relay
            .start_span("playback.span", payload(1))
            .await
            .expect("start_span should succeed");
        clock.advance(Duration::from_secs(3));
        relay
            .start_span("playback.span", payload(2))
            .await
            .expect("start_span should succeed");

        // The first span was closed and enqueued; the second is still open.
        assert_eq!(relay.queue_len().await, 1);

        clock.advance(Duration::from_secs(7));
        let duration = relay.end_span().await.expect("end_span should succeed");
        assert_eq!(duration, Some(7));
        assert_eq!(relay.queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_end_span_without_open_is_noop() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        assert_eq!(relay.end_span().await.expect("end_span should succeed"), None);
        assert_eq!(relay.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_stop_closes_span_and_delivers_detached() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let relay = start_relay(quiet_config(), &sink, &store, None, &clock).await;

        relay
            .track_event("screen.online", payload(1))
            .await
            .expect("track should succeed");
        relay
            .start_span("playback.span", payload(2))
            .await
            .expect("start_span should succeed");
        clock.advance(Duration::from_secs(4));

        relay.stop().await;

        assert_eq!(sink.detached_calls.load(Ordering::SeqCst), 1);
        let delivered = sink.delivered().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].duration_secs, Some(4));

        assert!(matches!(
            relay.track_event("late", payload(9)).await,
            Err(RelayError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_memory_only() {
        let sink = TestSink::new();
        let clock = Arc::new(ManualClock::new());
        let toggle = ToggleConnectivity::new(false);
        let relay = EventRelay::start(
            quiet_config(),
            Arc::clone(&sink) as Arc<dyn DeliverySink<Payload>>,
            Arc::new(FailingStore) as Arc<dyn QueueStore<Payload>>,
            Some(&toggle),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .await
        .expect("relay should start despite failing store");

        relay
            .track_event("screen.online", payload(1))
            .await
            .expect("track should succeed");
        assert!(relay.metrics().persistence_failures >= 1);
        assert_eq!(relay.queue_len().await, 1);

        toggle.set_online(true);
        wait_until(|| async { sink.batch_count().await == 1 }).await;
        assert_eq!(sink.delivered().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_fires_on_interval() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let config = RelayConfig::new().with_flush_interval(Duration::from_secs(30));
        let relay = start_relay(config, &sink, &store, None, &clock).await;

        relay
            .track_event("screen.heartbeat", payload(1))
            .await
            .expect("track should succeed");
        assert_eq!(sink.batch_count().await, 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(sink.batch_count().await, 1);
        assert_eq!(relay.queue_len().await, 0);
    }

    #[test]
    fn test_config_builder_and_validation() {
        let config = RelayConfig::new()
            .with_flush_interval(Duration::from_secs(10))
            .with_max_queue_size(25)
            .with_min_span_secs(2);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.max_queue_size, 25);
        assert!(config.validate().is_ok());

        assert!(matches!(
            RelayConfig::new()
                .with_flush_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroDuration { .. })
        ));
        assert!(matches!(
            RelayConfig::new().with_max_queue_size(0).validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RelayConfig::new().with_min_span_secs(-1).validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_development_preset() {
        let config = RelayConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_span_secs, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let sink = TestSink::new();
        let store = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new());
        let result = EventRelay::start(
            RelayConfig::new().with_max_queue_size(0),
            Arc::clone(&sink) as Arc<dyn DeliverySink<Payload>>,
            Arc::clone(&store) as Arc<dyn QueueStore<Payload>>,
            None,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .await;
        assert!(result.is_err());
    }
}
