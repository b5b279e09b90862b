//! Event sinks shared by concurrently running stream drivers.
//!
//! A sink accepts whole [`StreamEvent`]s; framing happens on the single
//! consumer side, so producers can never interleave partial frames.

use std::convert::Infallible;
use std::sync::{Mutex, PoisonError};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::normalized::{StreamEvent, sse_event};

/// The receiving side of a sink went away (typically: the client disconnected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination for normalized stream events.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Emit one event as an atomic unit.
    async fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed>;
}

/// Sink backed by a bounded channel with exactly one reader.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its single writer drains.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_closed| SinkClosed)
    }
}

/// Sink that records every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StreamEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events emitted so far.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events emitted for one target, in order.
    pub fn events_for(&self, target_id: &str) -> Vec<StreamEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.target_id() == Some(target_id))
            .collect()
    }
}

#[async_trait::async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Turn the receiving end of a [`ChannelSink`] into a stream of SSE frames.
///
/// `guard` is held for as long as the frame stream is alive; dropping the
/// stream (the client went away) drops the guard and cancels its token.
pub fn sse_frames(
    mut rx: mpsc::Receiver<StreamEvent>,
    guard: DropGuard,
) -> impl Stream<Item = Result<String, Infallible>> + Send {
    async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok(sse_event(&event));
        }
    }
}
