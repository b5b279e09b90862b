//! Fan-out over several targets sharing one event sink.
//!
//! The orchestrator launches one [`StreamDriver`] per target, waits for all
//! of them to settle, emits each successful target's `usage`, and finally a
//! single aggregate `complete`.
//!
//! # Example
//!
//! ```rust,ignore
//! use model_relay::llm::{AdapterRegistry, Orchestrator, Target};
//!
//! let orchestrator = Orchestrator::new(Arc::new(registry));
//! let outcomes = orchestrator
//!     .run(targets, None, false, sink, &cancel)
//!     .await?;
//! ```

use std::sync::Arc;

use futures::future;
use tokio_util::sync::CancellationToken;

use super::{
    AdapterError, AdapterRegistry, AdapterRequest, Message, ModelSelection, StreamDriver,
    StreamResult,
};
use crate::normalized::StreamEvent;
use crate::sink::EventSink;

/// One participant of a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Identity tagged onto every event this target produces.
    pub target_id: String,
    pub selection: ModelSelection,
    pub history: Vec<Message>,
}

/// Settled result of one target.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target_id: String,
    pub selection: ModelSelection,
    pub result: StreamResult,
}

/// A fan-out that failed as a whole before any target streamed.
#[derive(Debug, thiserror::Error)]
pub enum FanOutError {
    #[error("target '{target_id}' cannot start: {source}")]
    Configuration {
        target_id: String,
        #[source]
        source: AdapterError,
    },

    #[error("no targets to run")]
    NoTargets,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<AdapterRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Run every target concurrently against `sink` and settle all of them.
    ///
    /// With a single target, a provider that cannot be resolved fails the
    /// whole run before anything is emitted. With several targets the same
    /// problem is reported as that target's `error` event and the others
    /// proceed.
    ///
    /// Cancelling `cancel` stops every in-flight driver; no `complete` is
    /// emitted for a cancelled run.
    ///
    /// # Errors
    ///
    /// Returns [`FanOutError`] only for whole-run failures.
    pub async fn run(
        &self,
        targets: Vec<Target>,
        system_prompt: Option<&str>,
        web_search: bool,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TargetOutcome>, FanOutError> {
        if targets.is_empty() {
            return Err(FanOutError::NoTargets);
        }
        if let [only] = targets.as_slice()
            && let Err(source) = self.registry.resolve(only.selection.provider)
        {
            return Err(FanOutError::Configuration {
                target_id: only.target_id.clone(),
                source,
            });
        }

        tracing::info!(
            name: "llm.fanout.start",
            targets = targets.len(),
            web_search,
            "Starting fan-out"
        );

        let runs = targets.into_iter().map(|target| {
            self.run_target(
                target,
                system_prompt,
                web_search,
                Arc::clone(&sink),
                cancel.child_token(),
            )
        });
        let outcomes = future::join_all(runs).await;

        if cancel.is_cancelled() {
            tracing::info!(name: "llm.fanout.cancelled", "Fan-out cancelled by consumer");
        } else {
            // Nobody left to tell when the sink is already closed.
            let _ = sink.emit(StreamEvent::Complete).await;
        }

        let succeeded = outcomes.iter().filter(|o| o.result.success).count();
        tracing::info!(
            name: "llm.fanout.settled",
            succeeded,
            failed = outcomes.len() - succeeded,
            "Fan-out settled"
        );

        Ok(outcomes)
    }

    async fn run_target(
        &self,
        target: Target,
        system_prompt: Option<&str>,
        web_search: bool,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> TargetOutcome {
        let mut driver = StreamDriver::new(target.target_id.clone(), Arc::clone(&sink), cancel);
        let provider = target.selection.provider;

        let result = match self.registry.resolve(provider) {
            Ok(adapter) => {
                let req = AdapterRequest {
                    selection: &target.selection,
                    system_prompt,
                    history: &target.history,
                    web_search: web_search && adapter.supports_web_search(),
                };
                driver.run(adapter.as_ref(), req).await
            }
            Err(e) => driver.reject(&e).await,
        };

        if result.success
            && let Some(usage) = result.usage
        {
            let _ = sink.emit(StreamEvent::usage(&target.target_id, usage)).await;
        }

        let outcome = if result.success {
            "success"
        } else if result.cancelled {
            "cancelled"
        } else {
            "error"
        };
        metrics::counter!(
            "relay_target_outcomes_total",
            "provider" => provider.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        TargetOutcome {
            target_id: target.target_id,
            selection: target.selection,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::llm::{Provider, ScriptStep, ScriptedAdapter};
    use crate::normalized::{EventKind, Usage};
    use crate::sink::MemorySink;

    fn target(id: &str, provider: Provider) -> Target {
        Target {
            target_id: id.to_string(),
            selection: ModelSelection {
                provider,
                model_id: id.to_string(),
                settings: Default::default(),
                target_id: None,
            },
            history: vec![Message::user("hi")],
        }
    }

    fn orchestrator(adapters: Vec<ScriptedAdapter>) -> Orchestrator {
        let registry = adapters
            .into_iter()
            .fold(AdapterRegistry::new(), |r, a| r.with_adapter(Arc::new(a)));
        Orchestrator::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_settle_all_isolates_failure() {
        let orchestrator = orchestrator(vec![
            ScriptedAdapter::new(
                Provider::OpenAI,
                vec![ScriptStep::text("a"), ScriptStep::Fail("reset".into())],
            ),
            ScriptedAdapter::new(Provider::Anthropic, vec![ScriptStep::text("b")])
                .with_usage(Usage::new(1, 1))
                .with_delay(Duration::from_millis(5)),
        ]);
        let sink = Arc::new(MemorySink::new());

        let outcomes = orchestrator
            .run(
                vec![target("A", Provider::OpenAI), target("B", Provider::Anthropic)],
                None,
                false,
                sink.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].result.success);
        assert!(outcomes[1].result.success);

        let events = sink.events();
        let completes = events.iter().filter(|e| e.kind() == EventKind::Complete).count();
        assert_eq!(completes, 1);
        assert_eq!(events.last(), Some(&StreamEvent::Complete));

        let a: Vec<_> = sink.events_for("A").iter().map(StreamEvent::kind).collect();
        assert!(a.contains(&EventKind::Error));
        assert!(!a.contains(&EventKind::Usage));

        let b: Vec<_> = sink.events_for("B").iter().map(StreamEvent::kind).collect();
        assert_eq!(b, vec![EventKind::Latency, EventKind::Text, EventKind::Usage]);
    }

    #[tokio::test]
    async fn test_single_unconfigured_target_fails_whole_run() {
        let orchestrator = orchestrator(vec![
            ScriptedAdapter::new(Provider::Google, vec![ScriptStep::text("x")]).unconfigured(),
        ]);
        let sink = Arc::new(MemorySink::new());

        let err = orchestrator
            .run(
                vec![target("g", Provider::Google)],
                None,
                false,
                sink.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FanOutError::Configuration { ref target_id, .. } if target_id == "g"));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_target_among_many_is_per_target_error() {
        let orchestrator = orchestrator(vec![
            ScriptedAdapter::new(Provider::OpenAI, vec![ScriptStep::text("ok")]),
        ]);
        let sink = Arc::new(MemorySink::new());

        let outcomes = orchestrator
            .run(
                vec![target("o", Provider::OpenAI), target("g", Provider::Google)],
                None,
                false,
                sink.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes[1].result.error, Some(ErrorKind::ConfigurationError));
        assert_eq!(sink.events_for("g").len(), 1);
        assert_eq!(sink.events().last(), Some(&StreamEvent::Complete));
    }

    #[tokio::test]
    async fn test_cancel_stops_drivers_without_complete() {
        let orchestrator = orchestrator(vec![
            ScriptedAdapter::new(
                Provider::OpenAI,
                vec![ScriptStep::text("a"), ScriptStep::text("b")],
            )
            .with_delay(Duration::from_secs(60)),
        ]);
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let outcomes = orchestrator
            .run(
                vec![target("a", Provider::OpenAI)],
                None,
                false,
                sink.clone(),
                &cancel,
            )
            .await
            .unwrap();
        canceller.await.unwrap();

        assert!(outcomes[0].result.cancelled);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_empty_targets_rejected() {
        let orchestrator = orchestrator(vec![]);
        let sink = Arc::new(MemorySink::new());
        let err = orchestrator
            .run(vec![], None, false, sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FanOutError::NoTargets));
    }
}
