//! Ephemeral job handoff between "create" and "stream".
//!
//! A job is the full generation request, enriched with the caller and the
//! conversation placeholders, parked in a [`JobStore`] under a random opaque
//! id until the caller opens the stream. It is read once and deleted.
//!
//! # Backends
//!
//! - [`InMemoryJobStore`]: process-local map with TTL and a background reaper
//! - `RedisJobStore` (feature `redis`): `SET … EX ttl` / `GET` / `DEL`

pub mod controller;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use controller::{CreatedJob, JobController, OpenJob};
pub use memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisJobStore;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::auth::CallerId;
use crate::error::JobError;
use crate::llm::{Message, ModelSelection, Target};

/// Default lifetime of an unconsumed job.
pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// Body of a job-creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub prompt: String,
    pub models: Vec<ModelSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub web_search: bool,
    /// Continue an existing conversation instead of starting a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Prior turns; the prompt is appended as the final user message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,
}

impl JobRequest {
    /// Check the request shape.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidParameters`] describing the first problem.
    pub fn validate(&self, max_targets: usize) -> Result<(), JobError> {
        let invalid = |msg: String| Err(JobError::InvalidParameters(msg));

        if self.prompt.trim().is_empty() {
            return invalid("prompt must not be empty".into());
        }
        if self.models.is_empty() {
            return invalid("at least one model is required".into());
        }
        if self.models.len() > max_targets {
            return invalid(format!(
                "too many models: {} (max {max_targets})",
                self.models.len()
            ));
        }

        let mut explicit_ids = HashSet::new();
        for (i, sel) in self.models.iter().enumerate() {
            if sel.model_id.trim().is_empty() {
                return invalid(format!("models[{i}].modelId must not be empty"));
            }
            if let Some(t) = sel.settings.temperature
                && !(0.0..=1.0).contains(&t)
            {
                return invalid(format!("models[{i}].settings.temperature must be within [0, 1]"));
            }
            if sel.settings.max_output_tokens == Some(0) {
                return invalid(format!("models[{i}].settings.maxOutputTokens must be positive"));
            }
            if let Some(id) = &sel.target_id {
                if id.trim().is_empty() {
                    return invalid(format!("models[{i}].targetId must not be empty"));
                }
                if !explicit_ids.insert(id.as_str()) {
                    return invalid(format!("duplicate targetId '{id}'"));
                }
            }
        }
        Ok(())
    }
}

/// What a stored job carries: the request plus everything assigned at
/// creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub request: JobRequest,
    /// Caller that created the job; only they may stream it.
    pub owner: CallerId,
    pub conversation_id: String,
    pub prompt_id: String,
}

impl JobPayload {
    /// Expand the selections into fan-out targets.
    ///
    /// Target ids default to the model id; repeats get `#2`, `#3`, … so every
    /// target in one job is distinct.
    #[must_use]
    pub fn targets(&self) -> Vec<Target> {
        let mut history = self.request.history.clone();
        history.push(Message::user(&self.request.prompt));

        let mut seen: HashMap<&str, usize> = HashMap::new();
        self.request
            .models
            .iter()
            .map(|sel| {
                let base = sel.target_id.as_deref().unwrap_or(&sel.model_id);
                let n = seen.entry(base).or_default();
                *n += 1;
                let target_id = if *n == 1 {
                    base.to_string()
                } else {
                    format!("{base}#{n}")
                };
                Target {
                    target_id,
                    selection: sel.clone(),
                    history: history.clone(),
                }
            })
            .collect()
    }
}

/// Stored envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub payload: JobPayload,
    pub ttl_seconds: u64,
}

impl JobRecord {
    pub(crate) fn encode(&self) -> Result<String, JobStoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn decode(id: &str, raw: &str) -> Result<Self, JobStoreError> {
        serde_json::from_str(raw).map_err(|source| JobStoreError::Corrupt {
            id: id.to_string(),
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    /// The storage backend failed; never to be read as "not found".
    #[error("job store backend error: {0}")]
    Backend(String),

    #[error("failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record exists but cannot be decoded.
    #[error("stored job '{id}' is malformed: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// TTL-bounded key-value storage of pending jobs.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Store a payload under a fresh random id and return the id.
    async fn put(&self, payload: &JobPayload) -> Result<String, JobStoreError>;

    /// Fetch a payload; `None` if absent or expired.
    async fn get(&self, id: &str) -> Result<Option<JobPayload>, JobStoreError>;

    /// Remove a job. Removing a missing id is not an error.
    async fn delete(&self, id: &str) -> Result<(), JobStoreError>;
}

/// Generate a fresh opaque job id.
#[must_use]
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::llm::{MessageRole, Provider};

    #[test]
    fn test_request_deserializes_camel_case() {
        let json = r#"{
            "prompt": "hi",
            "models": [{"provider": "openai", "modelId": "gpt-4o"}],
            "systemPrompt": "be nice",
            "webSearch": true
        }"#;
        let req: JobRequest = serde_json::from_str(json).unwrap();
        assert!(req.web_search);
        assert_eq!(req.system_prompt.as_deref(), Some("be nice"));
        assert!(req.validate(8).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(request(vec![]).validate(8).is_err());

        let mut req = request(vec![selection(Provider::OpenAI, "gpt-4o")]);
        req.prompt = "   ".into();
        assert!(req.validate(8).is_err());

        let mut sel = selection(Provider::OpenAI, "gpt-4o");
        sel.settings.temperature = Some(1.5);
        assert!(request(vec![sel]).validate(8).is_err());

        let mut sel = selection(Provider::OpenAI, "gpt-4o");
        sel.settings.max_output_tokens = Some(0);
        assert!(request(vec![sel]).validate(8).is_err());

        let many = vec![selection(Provider::OpenAI, "gpt-4o"); 3];
        assert!(request(many).validate(2).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_explicit_target_ids() {
        let mut a = selection(Provider::OpenAI, "gpt-4o");
        a.target_id = Some("left".into());
        let mut b = selection(Provider::Anthropic, "claude");
        b.target_id = Some("left".into());
        let err = request(vec![a, b]).validate(8).unwrap_err();
        assert!(err.to_string().contains("duplicate targetId"));
    }

    #[test]
    fn test_targets_dedupe_ids_and_append_prompt() {
        let mut p = payload();
        p.request.history = vec![Message::user("earlier"), Message::assistant("reply")];
        p.request.models = vec![
            selection(Provider::OpenAI, "gpt-4o"),
            selection(Provider::OpenAI, "gpt-4o"),
            selection(Provider::Google, "gemini"),
        ];

        let targets = p.targets();
        let ids: Vec<_> = targets.iter().map(|t| t.target_id.as_str()).collect();
        assert_eq!(ids, vec!["gpt-4o", "gpt-4o#2", "gemini"]);

        let last = targets[0].history.last().unwrap();
        assert_eq!(last.role, MessageRole::User);
        assert_eq!(last.content, "Say hello");
        assert_eq!(targets[0].history.len(), 3);
    }

    #[test]
    fn test_record_roundtrip_and_corruption() {
        let record = JobRecord {
            id: "j1".into(),
            payload: payload(),
            ttl_seconds: 300,
        };
        let raw = record.encode().unwrap();
        assert!(raw.contains("\"ttlSeconds\":300"));
        assert_eq!(JobRecord::decode("j1", &raw).unwrap(), record);

        // Continuing a conversation keeps both the requested and assigned ids.
        let mut continued = record.clone();
        continued.payload.request.conversation_id = Some("c-1".into());
        let raw = continued.encode().unwrap();
        assert_eq!(JobRecord::decode("j1", &raw).unwrap(), continued);

        assert!(matches!(
            JobRecord::decode("j1", "{\"id\":\"j1\"}"),
            Err(JobStoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(new_job_id(), new_job_id());
    }
}
