//! Shared types for the SDK.
//!
//! These mirror the relay's request DTOs and the payloads of its event
//! stream, and are used by both the HTTP client and the embedded runtime.

use serde::{Deserialize, Serialize};

// =============================================================================
// Jobs API Types
// =============================================================================

/// Generation settings for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    /// Sampling temperature in `[0, 1]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Upper bound on generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// A provider/model pair to fan out to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    /// `openai`, `anthropic` or `google`.
    pub provider: String,
    /// Provider model id, e.g. `gpt-4o`.
    pub model_id: String,
    #[serde(default)]
    pub settings: ModelSettings,
    /// Stream identity for this model's events; defaults to `model_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

impl ModelSelection {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            settings: ModelSettings::default(),
            target_id: None,
        }
    }

    #[must_use]
    pub fn with_target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

/// A prior conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// `user` or `assistant`.
    pub role: String,
    pub content: String,
}

/// Request to create a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub prompt: String,
    pub models: Vec<ModelSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub web_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryMessage>,
}

impl CreateJobRequest {
    pub fn new(prompt: impl Into<String>, models: Vec<ModelSelection>) -> Self {
        Self {
            prompt: prompt.into(),
            models,
            ..Self::default()
        }
    }
}

/// Response from creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    /// Job id to stream.
    pub uid: String,
    /// Set when the job started a new conversation.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

// =============================================================================
// Stream Event Types
// =============================================================================

/// Token accounting for one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A `text` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEvent {
    pub target_id: String,
    pub text: String,
}

/// A `latency_ms` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyEvent {
    pub target_id: String,
    pub ms: u64,
}

/// A `usage` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub target_id: String,
    #[serde(flatten)]
    pub usage: Usage,
}

/// An `error` event: the named target failed. The stream itself is fine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub target_id: String,
    pub error: String,
    /// One of the relay's error kinds, e.g. `ConfigurationError`.
    pub error_type: String,
}

/// One decoded event from the job stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(TextEvent),
    Latency(LatencyEvent),
    Usage(UsageEvent),
    Error(ErrorEvent),
    Complete,
}

impl StreamEvent {
    /// Decode a frame. Unknown event names yield `Ok(None)`.
    pub fn decode(event: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let decoded = match event {
            "text" => Self::Text(serde_json::from_str(data)?),
            "latency_ms" => Self::Latency(serde_json::from_str(data)?),
            "usage" => Self::Usage(serde_json::from_str(data)?),
            "error" => Self::Error(serde_json::from_str(data)?),
            "complete" => Self::Complete,
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_wire_shape() {
        let mut req = CreateJobRequest::new(
            "Say hello",
            vec![ModelSelection::new("openai", "gpt-4o").with_target_id("left")],
        );
        req.system_prompt = Some("be brief".into());

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["prompt"], "Say hello");
        assert_eq!(json["systemPrompt"], "be brief");
        assert_eq!(json["webSearch"], false);
        assert_eq!(json["models"][0]["modelId"], "gpt-4o");
        assert_eq!(json["models"][0]["targetId"], "left");
        assert!(json.get("history").is_none());
        assert!(json.get("conversationId").is_none());
    }

    #[test]
    fn test_decode_usage_and_unknown() {
        let event = StreamEvent::decode(
            "usage",
            r#"{"targetId":"m1","inputTokens":3,"outputTokens":4,"totalTokens":7}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::Usage(UsageEvent {
                target_id: "m1".into(),
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 4,
                    total_tokens: 7
                },
            }))
        );
        assert_eq!(StreamEvent::decode("ping", "{}").unwrap(), None);
        assert_eq!(StreamEvent::decode("complete", "[DONE]").unwrap(), Some(StreamEvent::Complete));
    }
}
