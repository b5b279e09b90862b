//! Job lifecycle: create → open → stream → delete.
//!
//! Opening a job is split from streaming it so that job-level failures (not
//! found, wrong owner, malformed record) become plain HTTP errors before any
//! stream is opened. Once a job is open, [`JobController::stream_job`] runs
//! the fan-out and always deletes the job afterwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{JobPayload, JobRequest, JobStore, JobStoreError};
use crate::auth::CallerId;
use crate::bus::{EventBus, JobLifecycleEvent};
use crate::error::{ErrorKind, JobError};
use crate::llm::{FanOutError, Orchestrator, TargetOutcome};
use crate::normalized::StreamEvent;
use crate::persistence::{FinalMessage, PersistenceLayer};
use crate::sink::EventSink;

/// Response body of job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    pub uid: String,
    /// Present only when this request started a new conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

type ClaimSet = Arc<Mutex<HashSet<String>>>;

/// Marks a job as being streamed; released on drop.
#[derive(Debug)]
struct Claim {
    id: String,
    claims: ClaimSet,
}

impl Claim {
    fn acquire(claims: &ClaimSet, id: &str) -> Option<Self> {
        let inserted = claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        inserted.then(|| Self {
            id: id.to_string(),
            claims: Arc::clone(claims),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A job fetched and checked, ready to stream. Holding it keeps other
/// requests from opening the same id.
#[derive(Debug)]
pub struct OpenJob {
    id: String,
    payload: JobPayload,
    _claim: Claim,
}

impl OpenJob {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }
}

#[derive(Debug)]
pub struct JobController {
    store: Arc<dyn JobStore>,
    persistence: Arc<dyn PersistenceLayer>,
    orchestrator: Orchestrator,
    bus: Arc<dyn EventBus>,
    max_targets: usize,
    claims: ClaimSet,
}

impl JobController {
    pub fn new(
        store: Arc<dyn JobStore>,
        persistence: Arc<dyn PersistenceLayer>,
        orchestrator: Orchestrator,
        bus: Arc<dyn EventBus>,
        max_targets: usize,
    ) -> Self {
        Self {
            store,
            persistence,
            orchestrator,
            bus,
            max_targets,
            claims: ClaimSet::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate, materialize placeholders, and park the job.
    ///
    /// # Errors
    ///
    /// [`JobError::InvalidParameters`] for a malformed request (nothing is
    /// stored), or a store/persistence failure.
    pub async fn create_job(&self, caller: &CallerId, request: JobRequest) -> Result<CreatedJob, JobError> {
        request.validate(self.max_targets)?;

        let placeholders = self
            .persistence
            .create_conversation_placeholder(caller, &request)
            .await?;

        let targets = request.models.len();
        let payload = JobPayload {
            request,
            owner: caller.clone(),
            conversation_id: placeholders.conversation_id.clone(),
            prompt_id: placeholders.prompt_id,
        };
        let uid = self.store.put(&payload).await?;

        metrics::counter!("relay_jobs_created_total").increment(1);
        tracing::info!(
            name: "jobs.created",
            job_id = %uid,
            caller = %caller,
            targets,
            conversation_id = %payload.conversation_id,
            "Job created"
        );
        self.bus.publish(JobLifecycleEvent::JobCreated {
            job_id: uid.clone(),
            targets,
        });

        Ok(CreatedJob {
            uid,
            conversation_id: placeholders
                .created_conversation
                .then_some(placeholders.conversation_id),
        })
    }

    /// Fetch and check a job for `caller`.
    ///
    /// A job owned by someone else, or already being streamed, is reported
    /// as not found.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`], [`JobError::InvalidParameters`] for a record
    /// that no longer decodes or validates (it is deleted), or
    /// [`JobError::Store`] when the backend fails.
    pub async fn open_job(&self, uid: &str, caller: &CallerId) -> Result<OpenJob, JobError> {
        let not_found = || {
            metrics::counter!("relay_jobs_not_found_total").increment(1);
            tracing::info!(name: "jobs.not_found", job_id = %uid, "Job not found");
            JobError::NotFound
        };

        let claim = Claim::acquire(&self.claims, uid).ok_or_else(not_found)?;

        let payload = match self.store.get(uid).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Err(not_found()),
            Err(JobStoreError::Corrupt { source, .. }) => {
                tracing::warn!(name: "jobs.corrupt", job_id = %uid, error = %source, "Discarding malformed job");
                self.discard(uid).await;
                return Err(JobError::InvalidParameters("stored job is malformed".into()));
            }
            Err(e) => return Err(e.into()),
        };

        if payload.owner != *caller {
            return Err(not_found());
        }
        if let Err(e) = payload.request.validate(self.max_targets) {
            tracing::warn!(name: "jobs.invalid", job_id = %uid, error = %e, "Discarding invalid job");
            self.discard(uid).await;
            return Err(e);
        }

        Ok(OpenJob {
            id: uid.to_string(),
            payload,
            _claim: claim,
        })
    }

    /// Run the job's fan-out into `sink`, persist successful answers, and
    /// delete the job. Never fails; problems are events or log lines.
    pub async fn stream_job(
        &self,
        job: OpenJob,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Vec<TargetOutcome> {
        let OpenJob { id, payload, _claim } = job;

        metrics::counter!("relay_jobs_streamed_total").increment(1);
        tracing::info!(name: "jobs.stream.start", job_id = %id, "Streaming job");
        self.bus.publish(JobLifecycleEvent::JobStreamStarted { job_id: id.clone() });

        let targets = payload.targets();
        let fallback_target = targets
            .first()
            .map(|t| t.target_id.clone())
            .unwrap_or_default();

        let result = self
            .orchestrator
            .run(
                targets,
                payload.request.system_prompt.as_deref(),
                payload.request.web_search,
                Arc::clone(&sink),
                &cancel,
            )
            .await;

        let outcomes = match result {
            Ok(outcomes) => {
                self.persist(&payload, &outcomes).await;
                outcomes
            }
            Err(e) => {
                let (target_id, kind) = match &e {
                    FanOutError::Configuration { target_id, source } => (target_id.clone(), source.kind()),
                    FanOutError::NoTargets => (fallback_target, ErrorKind::InvalidParameters),
                };
                tracing::warn!(
                    name: "jobs.stream.failed",
                    job_id = %id,
                    error_type = %kind,
                    error = %e,
                    "Job failed before streaming"
                );
                let _ = sink.emit(StreamEvent::error(target_id, e.to_string(), kind)).await;
                Vec::new()
            }
        };

        let succeeded = outcomes.iter().filter(|o| o.result.success).count();
        self.bus.publish(JobLifecycleEvent::JobFinished {
            job_id: id.clone(),
            succeeded,
            failed: outcomes.len() - succeeded,
        });

        self.discard(&id).await;
        outcomes
    }

    async fn persist(&self, payload: &JobPayload, outcomes: &[TargetOutcome]) {
        for outcome in outcomes.iter().filter(|o| o.result.success) {
            let message = FinalMessage {
                conversation_id: payload.conversation_id.clone(),
                prompt_id: payload.prompt_id.clone(),
                target_id: outcome.target_id.clone(),
                provider: outcome.selection.provider,
                model_id: outcome.selection.model_id.clone(),
                content: outcome.result.content.clone(),
                usage: outcome.result.usage,
                latency_ms: outcome.result.latency_ms,
            };
            if let Err(e) = self.persistence.append_final_message(message).await {
                tracing::warn!(
                    name: "jobs.persist.failed",
                    target_id = %outcome.target_id,
                    error = %e,
                    "Failed to persist final message"
                );
            }
        }
    }

    /// Delete a job, logging instead of failing.
    async fn discard(&self, id: &str) {
        match self.store.delete(id).await {
            Ok(()) => {
                tracing::debug!(name: "jobs.deleted", job_id = %id, "Job deleted");
                self.bus.publish(JobLifecycleEvent::JobDeleted { job_id: id.to_string() });
            }
            Err(e) => {
                tracing::error!(name: "jobs.delete.failed", job_id = %id, error = %e, "Failed to delete job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::jobs::InMemoryJobStore;
    use crate::jobs::fixtures::{request, selection};
    use crate::llm::{AdapterRegistry, Provider, ScriptStep, ScriptedAdapter};
    use crate::normalized::{EventKind, Usage};
    use crate::persistence::{ConversationEntry, InMemoryPersistence};
    use crate::sink::MemorySink;

    struct Harness {
        controller: JobController,
        store: InMemoryJobStore,
        persistence: InMemoryPersistence,
        bus: BroadcastBus,
    }

    fn harness(adapters: Vec<ScriptedAdapter>) -> Harness {
        let registry = adapters
            .into_iter()
            .fold(AdapterRegistry::new(), |r, a| r.with_adapter(Arc::new(a)));
        let store = InMemoryJobStore::new(300);
        let persistence = InMemoryPersistence::new();
        let bus = BroadcastBus::new(64);
        let controller = JobController::new(
            Arc::new(store.clone()),
            Arc::new(persistence.clone()),
            Orchestrator::new(Arc::new(registry)),
            Arc::new(bus.clone()),
            8,
        );
        Harness {
            controller,
            store,
            persistence,
            bus,
        }
    }

    fn hello(provider: Provider) -> ScriptedAdapter {
        ScriptedAdapter::new(provider, vec![ScriptStep::text("Hel"), ScriptStep::text("lo")])
            .with_usage(Usage::new(3, 2))
    }

    #[tokio::test]
    async fn test_two_targets_stream_complete_and_delete() {
        let h = harness(vec![hello(Provider::OpenAI), hello(Provider::Anthropic)]);
        let caller = CallerId::new("u1");
        let created = h
            .controller
            .create_job(
                &caller,
                request(vec![
                    selection(Provider::OpenAI, "gpt-4o"),
                    selection(Provider::Anthropic, "claude"),
                ]),
            )
            .await
            .unwrap();
        assert!(created.conversation_id.is_some());

        let job = h.controller.open_job(&created.uid, &caller).await.unwrap();
        let sink = Arc::new(MemorySink::new());
        let outcomes = h
            .controller
            .stream_job(job, sink.clone(), CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.content == "Hello"));
        assert_eq!(sink.events().last(), Some(&StreamEvent::Complete));
        assert!(h.store.get(&created.uid).await.unwrap().is_none());

        let conversation = h
            .persistence
            .conversation(created.conversation_id.as_deref().unwrap())
            .unwrap();
        let answers = conversation
            .entries
            .iter()
            .filter(|e| matches!(e, ConversationEntry::Answer { .. }))
            .count();
        assert_eq!(answers, 2);
    }

    #[tokio::test]
    async fn test_single_unconfigured_target_emits_one_error() {
        let h = harness(vec![hello(Provider::Google).unconfigured()]);
        let caller = CallerId::anonymous();
        let created = h
            .controller
            .create_job(&caller, request(vec![selection(Provider::Google, "gemini")]))
            .await
            .unwrap();

        let job = h.controller.open_job(&created.uid, &caller).await.unwrap();
        let sink = Arc::new(MemorySink::new());
        h.controller
            .stream_job(job, sink.clone(), CancellationToken::new())
            .await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error(e) => {
                assert_eq!(e.target_id, "gemini");
                assert_eq!(e.error_type, ErrorKind::ConfigurationError);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.store.get(&created.uid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_jobs_are_not_found() {
        let h = harness(vec![hello(Provider::OpenAI)]);
        let owner = CallerId::new("owner");
        let created = h
            .controller
            .create_job(&owner, request(vec![selection(Provider::OpenAI, "gpt-4o")]))
            .await
            .unwrap();

        assert!(matches!(
            h.controller.open_job("nope", &owner).await,
            Err(JobError::NotFound)
        ));
        assert!(matches!(
            h.controller.open_job(&created.uid, &CallerId::new("intruder")).await,
            Err(JobError::NotFound)
        ));
        // The owner can still stream it.
        assert!(h.controller.open_job(&created.uid, &owner).await.is_ok());
    }

    #[tokio::test]
    async fn test_job_cannot_be_opened_twice_concurrently() {
        let h = harness(vec![hello(Provider::OpenAI)]);
        let caller = CallerId::anonymous();
        let created = h
            .controller
            .create_job(&caller, request(vec![selection(Provider::OpenAI, "gpt-4o")]))
            .await
            .unwrap();

        let first = h.controller.open_job(&created.uid, &caller).await.unwrap();
        assert!(matches!(
            h.controller.open_job(&created.uid, &caller).await,
            Err(JobError::NotFound)
        ));

        h.controller
            .stream_job(first, Arc::new(MemorySink::new()), CancellationToken::new())
            .await;
        assert!(matches!(
            h.controller.open_job(&created.uid, &caller).await,
            Err(JobError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_invalid_request_stores_nothing() {
        let h = harness(vec![]);
        let err = h
            .controller
            .create_job(&CallerId::anonymous(), request(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidParameters(_)));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_rejected_and_deleted() {
        let h = harness(vec![]);
        h.store.insert_raw("bad", "{\"id\":\"bad\"}").await;

        let err = h
            .controller
            .open_job("bad", &CallerId::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_target_is_not_persisted() {
        let h = harness(vec![
            hello(Provider::OpenAI),
            ScriptedAdapter::new(Provider::Anthropic, vec![ScriptStep::Error("nope".into())]),
        ]);
        let caller = CallerId::anonymous();
        let created = h
            .controller
            .create_job(
                &caller,
                request(vec![
                    selection(Provider::OpenAI, "gpt-4o"),
                    selection(Provider::Anthropic, "claude"),
                ]),
            )
            .await
            .unwrap();
        let job = h.controller.open_job(&created.uid, &caller).await.unwrap();
        let sink = Arc::new(MemorySink::new());
        h.controller
            .stream_job(job, sink.clone(), CancellationToken::new())
            .await;

        let claude: Vec<_> = sink.events_for("claude").iter().map(StreamEvent::kind).collect();
        assert_eq!(claude, vec![EventKind::Error]);

        let conversation = h
            .persistence
            .conversation(created.conversation_id.as_deref().unwrap())
            .unwrap();
        let answers: Vec<_> = conversation
            .entries
            .iter()
            .filter_map(|e| match e {
                ConversationEntry::Answer { message, .. } => Some(message.target_id.as_str()),
                ConversationEntry::Prompt { .. } => None,
            })
            .collect();
        assert_eq!(answers, vec!["gpt-4o"]);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let h = harness(vec![hello(Provider::OpenAI)]);
        let mut rx = h.bus.subscribe();
        let caller = CallerId::anonymous();
        let created = h
            .controller
            .create_job(&caller, request(vec![selection(Provider::OpenAI, "gpt-4o")]))
            .await
            .unwrap();
        let job = h.controller.open_job(&created.uid, &caller).await.unwrap();
        h.controller
            .stream_job(job, Arc::new(MemorySink::new()), CancellationToken::new())
            .await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], JobLifecycleEvent::JobCreated { targets: 1, .. }));
        assert!(matches!(seen[1], JobLifecycleEvent::JobStreamStarted { .. }));
        assert!(matches!(
            seen[2],
            JobLifecycleEvent::JobFinished { succeeded: 1, failed: 0, .. }
        ));
        assert!(matches!(seen[3], JobLifecycleEvent::JobDeleted { .. }));
    }
}
