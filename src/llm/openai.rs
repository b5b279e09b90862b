//! `OpenAI` adapter.
//!
//! Plain generations go through Chat Completions (`/v1/chat/completions`).
//! When web search is requested the call switches to the Responses API
//! (`/v1/responses`) with the `web_search_preview` tool attached, since Chat
//! Completions has no provider-side search tool.

use anyhow::Context;
use serde_json::{Value, json};

use super::sse::{FrameParser, SseFrame, parts_from_sse, provider_error, read_usage};
use super::{
    AdapterError, AdapterRequest, ModelClientAdapter, ModelStream, Provider, ProviderSettings,
    StreamPart, status_error, usage_channel,
};
use crate::normalized::{DONE_SENTINEL, Usage};

/// Adapter for the `OpenAI` HTTP API and compatible servers.
#[derive(Clone)]
pub struct OpenAiAdapter {
    http: reqwest::Client,
    settings: ProviderSettings,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("settings", &self.settings)
            .finish()
    }
}

impl OpenAiAdapter {
    #[must_use]
    pub fn new(http: reqwest::Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }
}

fn history_messages(req: &AdapterRequest<'_>) -> Vec<Value> {
    req.history
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect()
}

fn chat_body(req: &AdapterRequest<'_>) -> Value {
    let mut messages = Vec::with_capacity(req.history.len() + 1);
    if let Some(system) = req.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.extend(history_messages(req));

    let mut body = json!({
        "model": req.selection.model_id,
        "stream": true,
        "stream_options": { "include_usage": true },
        "messages": messages,
    });
    let settings = &req.selection.settings;
    if let Some(t) = settings.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(n) = settings.max_output_tokens {
        body["max_completion_tokens"] = json!(n);
    }
    body
}

fn responses_body(req: &AdapterRequest<'_>) -> Value {
    let mut body = json!({
        "model": req.selection.model_id,
        "stream": true,
        "input": history_messages(req),
        "tools": [{ "type": "web_search_preview" }],
    });
    if let Some(system) = req.system_prompt {
        body["instructions"] = json!(system);
    }
    let settings = &req.selection.settings;
    if let Some(t) = settings.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(n) = settings.max_output_tokens {
        body["max_output_tokens"] = json!(n);
    }
    body
}

/// Chat Completions chunks: `choices[0].delta.content` plus a final usage chunk.
#[derive(Debug, Default)]
struct ChatParser {
    usage: Option<Usage>,
}

impl FrameParser for ChatParser {
    fn parse(&mut self, frame: &SseFrame) -> anyhow::Result<Option<StreamPart>> {
        if frame.data == DONE_SENTINEL {
            return Ok(None);
        }
        let v: Value =
            serde_json::from_str(&frame.data).context("malformed chat completion chunk")?;

        if let Some(message) = provider_error(&v) {
            return Ok(Some(StreamPart::Error(message)));
        }
        if let Some(u) = v.get("usage").filter(|u| u.is_object()) {
            self.usage = Some(read_usage(u, "prompt_tokens", "completion_tokens", "total_tokens"));
        }

        let text = v["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|s| !s.is_empty());
        Ok(text.map(|s| StreamPart::TextDelta(s.to_string())))
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

/// Responses API events, keyed by their `type` field.
#[derive(Debug, Default)]
struct ResponsesParser {
    usage: Option<Usage>,
}

impl FrameParser for ResponsesParser {
    fn parse(&mut self, frame: &SseFrame) -> anyhow::Result<Option<StreamPart>> {
        if frame.data == DONE_SENTINEL {
            return Ok(None);
        }
        let v: Value = serde_json::from_str(&frame.data).context("malformed responses event")?;
        let kind = v["type"]
            .as_str()
            .or(frame.event.as_deref())
            .unwrap_or_default();

        let part = match kind {
            "response.output_text.delta" => v["delta"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| StreamPart::TextDelta(s.to_string())),
            "response.completed" => {
                if let Some(u) = v["response"].get("usage").filter(|u| u.is_object()) {
                    self.usage = Some(read_usage(u, "input_tokens", "output_tokens", "total_tokens"));
                }
                None
            }
            "response.failed" => Some(StreamPart::Error(
                provider_error(&v["response"])
                    .unwrap_or_else(|| "response failed".to_string()),
            )),
            "error" => Some(StreamPart::Error(
                v["message"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| provider_error(&v))
                    .unwrap_or_else(|| v.to_string()),
            )),
            _ => None,
        };
        Ok(part)
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

#[async_trait::async_trait]
impl ModelClientAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    fn ensure_configured(&self) -> Result<(), AdapterError> {
        self.settings
            .key()
            .map(|_| ())
            .ok_or(AdapterError::Configuration(Provider::OpenAI))
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn stream(&self, req: AdapterRequest<'_>) -> Result<ModelStream, AdapterError> {
        let key = self
            .settings
            .key()
            .ok_or(AdapterError::Configuration(Provider::OpenAI))?;

        let url = Provider::OpenAI.stream_url(
            self.settings.base_url_or(Provider::OpenAI),
            &req.selection.model_id,
            req.web_search,
        );
        let body = if req.web_search {
            responses_body(&req)
        } else {
            chat_body(&req)
        };

        tracing::debug!(
            name: "llm.openai.request",
            model = %req.selection.model_id,
            web_search = req.web_search,
            "Starting OpenAI stream"
        );

        let resp = self.http.post(&url).bearer_auth(key).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let (reporter, usage) = usage_channel();
        let parts = if req.web_search {
            parts_from_sse(resp.bytes_stream(), ResponsesParser::default(), reporter)
        } else {
            parts_from_sse(resp.bytes_stream(), ChatParser::default(), reporter)
        };
        Ok(ModelStream::new(parts, usage))
    }
}
