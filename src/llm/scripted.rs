//! An adapter that replays a fixed script instead of calling a provider.
//!
//! Used by the integration tests and handy for exercising clients without
//! credentials.

use std::time::Duration;

use super::{
    AdapterError, AdapterRequest, ModelClientAdapter, ModelStream, PartStream, Provider,
    StreamPart, usage_channel,
};
use crate::normalized::Usage;

/// One step of a scripted generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Text(String),
    /// Provider-reported generation error.
    Error(String),
    /// Provider-side tool failure.
    ToolError(String),
    /// Transport fault mid-stream.
    Fail(String),
    /// Panic inside the part stream.
    Panic,
}

impl ScriptStep {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedAdapter {
    provider: Provider,
    steps: Vec<ScriptStep>,
    usage: Option<Usage>,
    configured: bool,
    delay: Duration,
}

impl ScriptedAdapter {
    /// A configured adapter that yields `steps` and reports no usage.
    pub fn new(provider: Provider, steps: Vec<ScriptStep>) -> Self {
        Self {
            provider,
            steps,
            usage: None,
            configured: true,
            delay: Duration::ZERO,
        }
    }

    /// Report this usage after the last step.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Pause before each step.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Behave as if credentials were missing.
    #[must_use]
    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }
}

#[async_trait::async_trait]
impl ModelClientAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn ensure_configured(&self) -> Result<(), AdapterError> {
        if self.configured {
            Ok(())
        } else {
            Err(AdapterError::Configuration(self.provider))
        }
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn stream(&self, _req: AdapterRequest<'_>) -> Result<ModelStream, AdapterError> {
        self.ensure_configured()?;

        let steps = self.steps.clone();
        let usage = self.usage;
        let delay = self.delay;
        let (reporter, usage_fut) = usage_channel();

        let parts: PartStream = Box::pin(async_stream::stream! {
            for step in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    ScriptStep::Text(s) => yield Ok(StreamPart::TextDelta(s)),
                    ScriptStep::Error(s) => yield Ok(StreamPart::Error(s)),
                    ScriptStep::ToolError(s) => yield Ok(StreamPart::ToolError(s)),
                    ScriptStep::Fail(s) => {
                        yield Err(anyhow::anyhow!(s));
                        return;
                    }
                    ScriptStep::Panic => panic!("scripted adapter panic"),
                }
            }
            if let Some(usage) = usage {
                reporter.report(usage);
            }
        });

        Ok(ModelStream::new(parts, usage_fut))
    }
}
