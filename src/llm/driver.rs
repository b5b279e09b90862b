//! Single-target stream driver.
//!
//! A [`StreamDriver`] owns exactly one adapter call. It turns the adapter's
//! parts into normalized [`StreamEvent`]s for its target and returns a
//! [`StreamResult`]; it never returns an error and never lets a panic escape.
//!
//! # State machine
//!
//! ```text
//! NotStarted ──► Streaming ──► Completed
//!                    │
//!                    └───────► Failed
//! ```
//!
//! Per target the driver guarantees:
//!
//! - at most one `latency_ms` event, emitted right before the first `text`
//! - `text` events in generation order
//! - after an `error` event, nothing else for this target
//!
//! `usage` is not emitted here; the orchestrator emits it from the result.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{AdapterError, AdapterRequest, ModelClientAdapter, NextPart, StreamPart};
use crate::error::ErrorKind;
use crate::normalized::{StreamEvent, Usage};
use crate::sink::{EventSink, SinkClosed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    NotStarted,
    Streaming,
    Completed,
    Failed,
}

/// Terminal outcome of one driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResult {
    pub success: bool,
    /// Concatenation of every emitted text delta.
    pub content: String,
    pub usage: Option<Usage>,
    pub latency_ms: Option<u64>,
    /// Kind of the error event emitted for this target, if any.
    pub error: Option<ErrorKind>,
    /// The run stopped because the consumer went away.
    pub cancelled: bool,
}

impl StreamResult {
    fn failed(kind: ErrorKind, content: String, latency_ms: Option<u64>) -> Self {
        Self {
            success: false,
            content,
            latency_ms,
            error: Some(kind),
            ..Self::default()
        }
    }

    fn cancelled(content: String, latency_ms: Option<u64>) -> Self {
        Self {
            success: false,
            content,
            latency_ms,
            cancelled: true,
            ..Self::default()
        }
    }
}

/// Drives one adapter call for one target.
pub struct StreamDriver {
    target_id: String,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    state: DriverState,
    content: String,
    latency_ms: Option<u64>,
}

impl std::fmt::Debug for StreamDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDriver")
            .field("target_id", &self.target_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl StreamDriver {
    pub fn new(
        target_id: impl Into<String>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            sink,
            cancel,
            state: DriverState::NotStarted,
            content: String::new(),
            latency_ms: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state
    }

    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Drive `adapter` to a terminal state.
    pub async fn run(&mut self, adapter: &dyn ModelClientAdapter, req: AdapterRequest<'_>) -> StreamResult {
        let outcome = AssertUnwindSafe(self.drive(adapter, req)).catch_unwind().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    name: "llm.driver.panic",
                    target_id = %self.target_id,
                    error = %message,
                    "Stream driver panicked"
                );
                if self.state == DriverState::Failed {
                    return StreamResult::failed(
                        ErrorKind::InternalServerError,
                        std::mem::take(&mut self.content),
                        self.latency_ms,
                    );
                }
                self.fail(format!("internal error: {message}"), ErrorKind::InternalServerError)
                    .await
            }
        }
    }

    /// Fail a target that could not even be started, e.g. an unknown or
    /// unconfigured provider.
    pub async fn reject(&mut self, err: &AdapterError) -> StreamResult {
        self.fail(err.to_string(), err.kind()).await
    }

    async fn drive(&mut self, adapter: &dyn ModelClientAdapter, req: AdapterRequest<'_>) -> StreamResult {
        self.state = DriverState::Streaming;
        let started = Instant::now();

        let started_stream = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return self.stop(),
            res = adapter.stream(req) => res,
        };
        let mut stream = match started_stream {
            Ok(stream) => stream,
            Err(e) => return self.fail(e.to_string(), e.kind()).await,
        };

        loop {
            match stream.next_part(&self.cancel).await {
                NextPart::Part(StreamPart::TextDelta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    if self.latency_ms.is_none() {
                        let ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        self.latency_ms = Some(ms);
                        metrics::histogram!(
                            "relay_first_token_latency_ms",
                            "provider" => adapter.provider().as_str()
                        )
                        .record(latency_sample(ms));
                        if self.emit(StreamEvent::latency(&self.target_id, ms)).await.is_err() {
                            return self.stop();
                        }
                    }
                    self.content.push_str(&text);
                    if self.emit(StreamEvent::text(&self.target_id, text)).await.is_err() {
                        return self.stop();
                    }
                }
                NextPart::Part(StreamPart::Error(message)) => {
                    drop(stream);
                    return self.fail(message, ErrorKind::StreamError).await;
                }
                NextPart::Part(StreamPart::ToolError(message)) => {
                    drop(stream);
                    return self.fail(message, ErrorKind::StreamToolError).await;
                }
                NextPart::Failed(e) => {
                    drop(stream);
                    return self
                        .fail(format!("{e:#}"), ErrorKind::InternalServerError)
                        .await;
                }
                NextPart::Cancelled => return self.stop(),
                NextPart::Exhausted => break,
            }
        }

        let usage = match stream.total_usage(&self.cancel).await {
            None => return self.stop(),
            Some(Ok(usage)) => Some(usage),
            Some(Err(e)) => {
                tracing::warn!(
                    name: "llm.driver.usage_missing",
                    target_id = %self.target_id,
                    error = %format!("{e:#}"),
                    "Provider finished without usage"
                );
                None
            }
        };

        self.state = DriverState::Completed;
        tracing::debug!(
            name: "llm.driver.completed",
            target_id = %self.target_id,
            chars = self.content.len(),
            latency_ms = ?self.latency_ms,
            "Target completed"
        );

        StreamResult {
            success: true,
            content: std::mem::take(&mut self.content),
            usage,
            latency_ms: self.latency_ms,
            error: None,
            cancelled: false,
        }
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.sink.emit(event).await
    }

    async fn fail(&mut self, message: String, kind: ErrorKind) -> StreamResult {
        self.state = DriverState::Failed;
        tracing::warn!(
            name: "llm.driver.failed",
            target_id = %self.target_id,
            error_type = %kind,
            error = %message,
            "Target failed"
        );
        // A closed sink means nobody is listening for the error either.
        let _ = self
            .emit(StreamEvent::error(&self.target_id, message, kind))
            .await;
        StreamResult::failed(kind, std::mem::take(&mut self.content), self.latency_ms)
    }

    fn stop(&mut self) -> StreamResult {
        self.state = DriverState::Failed;
        tracing::debug!(
            name: "llm.driver.cancelled",
            target_id = %self.target_id,
            "Target cancelled"
        );
        StreamResult::cancelled(std::mem::take(&mut self.content), self.latency_ms)
    }
}

/// Histogram value for a latency; clamps rather than losing precision.
fn latency_sample(ms: u64) -> f64 {
    f64::from(u32::try_from(ms).unwrap_or(u32::MAX))
}
