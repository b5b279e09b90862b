//! Model client adapters, the single-target stream driver, and the fan-out
//! coordinator.
//!
//! # Overview
//!
//! The [`ModelClientAdapter`] trait is the one capability every provider
//! implements: turn a [`ModelSelection`] plus conversation history into a
//! push-sequence of [`StreamPart`]s and a total-usage future. Adapters are
//! registered per [`Provider`] in an [`AdapterRegistry`] built at startup.
//!
//! On top of adapters:
//!
//! - [`StreamDriver`] drives one adapter call to completion and emits
//!   normalized events for one target.
//! - [`Orchestrator`] launches one driver per target concurrently against a
//!   shared sink and settles all of them.
//!
//! # Adapters
//!
//! - [`OpenAiAdapter`]: Chat Completions (`/v1/chat/completions`), or the
//!   Responses API (`/v1/responses`) when web search is requested
//! - [`AnthropicAdapter`]: Messages API (`/v1/messages`)
//! - [`GoogleAdapter`]: Gemini `streamGenerateContent`
//! - [`ScriptedAdapter`]: replays a fixed script; used by tests and demos

pub mod anthropic;
pub mod driver;
pub mod google;
pub mod openai;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod scripted;
mod sse;

pub use anthropic::AnthropicAdapter;
pub use driver::{DriverState, StreamDriver, StreamResult};
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;
pub use orchestrator::{FanOutError, Orchestrator, Target, TargetOutcome};
pub use provider::{Provider, ProviderSettings};
pub use registry::AdapterRegistry;
pub use scripted::{ScriptStep, ScriptedAdapter};

use std::pin::Pin;

use anyhow::Context;
use futures::{Future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::normalized::Usage;

/// Per-request generation settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    /// Sampling temperature in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Upper bound on generated tokens; must be positive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// One provider/model pair participating in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    pub provider: Provider,
    pub model_id: String,
    #[serde(default)]
    pub settings: ModelSettings,
    /// Explicit stream identity; defaults to `model_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Provider output normalized into the three kinds the driver understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPart {
    /// A fragment of generated text.
    TextDelta(String),
    /// The provider reported a generation failure.
    Error(String),
    /// A provider-side tool failed.
    ToolError(String),
}

/// Everything an adapter needs for one streaming call.
#[derive(Debug, Clone, Copy)]
pub struct AdapterRequest<'a> {
    pub selection: &'a ModelSelection,
    pub system_prompt: Option<&'a str>,
    pub history: &'a [Message],
    pub web_search: bool,
}

pub type PartStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamPart>> + Send>>;
pub type UsageFuture = Pin<Box<dyn Future<Output = anyhow::Result<Usage>> + Send>>;

/// A started provider call: the push-sequence of parts plus its usage total.
///
/// Dropping a `ModelStream` drops the underlying provider connection.
pub struct ModelStream {
    parts: PartStream,
    usage: UsageFuture,
}

impl std::fmt::Debug for ModelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStream").finish_non_exhaustive()
    }
}

/// Outcome of waiting for the next part under a cancellation token.
#[derive(Debug)]
pub enum NextPart {
    Part(StreamPart),
    /// The transport or the adapter failed mid-stream.
    Failed(anyhow::Error),
    Exhausted,
    Cancelled,
}

impl ModelStream {
    pub fn new(parts: PartStream, usage: UsageFuture) -> Self {
        Self { parts, usage }
    }

    /// Wait for the next part, giving up as soon as `cancel` fires.
    pub async fn next_part(&mut self, cancel: &CancellationToken) -> NextPart {
        tokio::select! {
            biased;
            () = cancel.cancelled() => NextPart::Cancelled,
            item = self.parts.next() => match item {
                Some(Ok(part)) => NextPart::Part(part),
                Some(Err(e)) => NextPart::Failed(e),
                None => NextPart::Exhausted,
            },
        }
    }

    /// Wait for the usage total once the parts are exhausted.
    pub async fn total_usage(self, cancel: &CancellationToken) -> Option<anyhow::Result<Usage>> {
        let Self { parts, usage } = self;
        drop(parts);
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            usage = usage => Some(usage),
        }
    }
}

/// Sending half of a usage future; adapters report once their stream ends.
#[derive(Debug)]
pub struct UsageReporter(oneshot::Sender<Usage>);

impl UsageReporter {
    pub fn report(self, usage: Usage) {
        // The receiver is gone when the driver stopped listening; nothing to do.
        let _ = self.0.send(usage);
    }
}

/// Create a linked usage reporter and future.
#[must_use]
pub fn usage_channel() -> (UsageReporter, UsageFuture) {
    let (tx, rx) = oneshot::channel();
    let fut = async move {
        rx.await
            .context("provider stream ended without reporting usage")
    };
    (UsageReporter(tx), Box::pin(fut))
}

/// Failure to start a provider call.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("no credentials configured for provider '{0}'")]
    Configuration(Provider),

    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl AdapterError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Status { status, .. } if *status == 400 || *status == 422 => {
                ErrorKind::InvalidParameters
            }
            Self::Request(_) | Self::Status { .. } => ErrorKind::InternalServerError,
        }
    }
}

/// The capability every provider implements.
#[async_trait::async_trait]
pub trait ModelClientAdapter: Send + Sync + std::fmt::Debug {
    /// Provider this adapter talks to.
    fn provider(&self) -> Provider;

    /// Fail fast when credentials are missing; never touches the network.
    fn ensure_configured(&self) -> Result<(), AdapterError>;

    /// Whether a provider-native web search tool can be attached.
    fn supports_web_search(&self) -> bool {
        false
    }

    /// Start a streaming call.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] before any network call when
    /// credentials are missing, or a request/status error if the provider
    /// refuses the call.
    async fn stream(&self, req: AdapterRequest<'_>) -> Result<ModelStream, AdapterError>;
}

/// Read a non-success response into an [`AdapterError::Status`].
pub(crate) async fn status_error(resp: reqwest::Response) -> AdapterError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    AdapterError::Status { status, body }
}
