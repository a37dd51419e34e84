//! Open-ended interval events.
//!
//! A span tracks something that is currently happening (content playing on
//! a screen) and becomes a single queued event with a computed duration
//! when it closes. The relay holds at most one open span at a time.

use marquee_core::{EventKind, QueuedEvent, SessionId, Timestamp};

/// An open interval event.
#[derive(Debug, Clone)]
pub struct ActiveSpan<P> {
    kind: EventKind,
    payload: P,
    started_at: Timestamp,
}

impl<P> ActiveSpan<P> {
    /// Open a span at the given instant.
    pub fn open(kind: impl Into<EventKind>, payload: P, started_at: Timestamp) -> Self {
        Self {
            kind: kind.into(),
            payload,
            started_at,
        }
    }

    /// The event kind this span will close into.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// When the span was opened.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Elapsed milliseconds between open and `ended_at`.
    pub fn elapsed_ms(&self, ended_at: Timestamp) -> i64 {
        (ended_at - self.started_at).num_milliseconds()
    }

    /// Elapsed time rounded to the nearest second.
    pub fn duration_secs(&self, ended_at: Timestamp) -> i64 {
        (self.elapsed_ms(ended_at) as f64 / 1000.0).round() as i64
    }

    /// Close the span into a completed event.
    ///
    /// The event is recorded at the span's start (the interval's anchor)
    /// with the rounded duration attached.
    pub fn into_event(self, ended_at: Timestamp, session_id: SessionId) -> QueuedEvent<P> {
        let duration = self.duration_secs(ended_at);
        QueuedEvent::new(self.kind, self.payload, self.started_at, session_id)
            .with_duration(duration)
    }
}
