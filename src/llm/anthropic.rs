//! Anthropic Messages API adapter (`/v1/messages`).

use anyhow::Context;
use serde_json::{Value, json};

use super::sse::{FrameParser, SseFrame, parts_from_sse, provider_error};
use super::{
    AdapterError, AdapterRequest, ModelClientAdapter, ModelStream, Provider, ProviderSettings,
    StreamPart, status_error, usage_channel,
};
use crate::normalized::Usage;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const WEB_SEARCH_MAX_USES: u32 = 5;

/// Adapter for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicAdapter {
    http: reqwest::Client,
    settings: ProviderSettings,
}

impl std::fmt::Debug for AnthropicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdapter")
            .field("settings", &self.settings)
            .finish()
    }
}

impl AnthropicAdapter {
    #[must_use]
    pub fn new(http: reqwest::Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }
}

fn request_body(req: &AdapterRequest<'_>) -> Value {
    let messages: Vec<Value> = req
        .history
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    let settings = &req.selection.settings;

    let mut body = json!({
        "model": req.selection.model_id,
        "max_tokens": settings.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": true,
    });
    if let Some(system) = req.system_prompt {
        body["system"] = json!(system);
    }
    if let Some(t) = settings.temperature {
        body["temperature"] = json!(t);
    }
    if req.web_search {
        body["tools"] = json!([{
            "type": "web_search_20250305",
            "name": "web_search",
            "max_uses": WEB_SEARCH_MAX_USES,
        }]);
    }
    body
}

/// Messages stream events. Input tokens arrive with `message_start`, output
/// tokens with the closing `message_delta`.
#[derive(Debug, Default)]
struct MessagesParser {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl FrameParser for MessagesParser {
    fn parse(&mut self, frame: &SseFrame) -> anyhow::Result<Option<StreamPart>> {
        let v: Value = serde_json::from_str(&frame.data).context("malformed messages event")?;
        let kind = frame
            .event
            .as_deref()
            .or_else(|| v["type"].as_str())
            .unwrap_or_default();

        let part = match kind {
            "message_start" => {
                let usage = &v["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_u64().or(self.input_tokens);
                self.output_tokens = usage["output_tokens"].as_u64().or(self.output_tokens);
                None
            }
            "message_delta" => {
                self.output_tokens = v["usage"]["output_tokens"].as_u64().or(self.output_tokens);
                None
            }
            "content_block_delta" if v["delta"]["type"] == "text_delta" => v["delta"]["text"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| StreamPart::TextDelta(s.to_string())),
            "content_block_start" => tool_error(&v["content_block"]).map(StreamPart::ToolError),
            "error" => Some(StreamPart::Error(
                provider_error(&v).unwrap_or_else(|| v.to_string()),
            )),
            _ => None,
        };
        Ok(part)
    }

    fn usage(&self) -> Option<Usage> {
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return None;
        }
        Some(Usage::new(
            self.input_tokens.unwrap_or(0),
            self.output_tokens.unwrap_or(0),
        ))
    }
}

/// A failed server-side web search shows up as a result block carrying an
/// error code instead of results.
fn tool_error(block: &Value) -> Option<String> {
    if block["type"] != "web_search_tool_result" {
        return None;
    }
    let content = &block["content"];
    if content["type"] != "web_search_tool_result_error" {
        return None;
    }
    let code = content["error_code"].as_str().unwrap_or("unknown");
    Some(format!("web search failed: {code}"))
}

#[async_trait::async_trait]
impl ModelClientAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn ensure_configured(&self) -> Result<(), AdapterError> {
        self.settings
            .key()
            .map(|_| ())
            .ok_or(AdapterError::Configuration(Provider::Anthropic))
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn stream(&self, req: AdapterRequest<'_>) -> Result<ModelStream, AdapterError> {
        let key = self
            .settings
            .key()
            .ok_or(AdapterError::Configuration(Provider::Anthropic))?;

        let url = Provider::Anthropic.stream_url(
            self.settings.base_url_or(Provider::Anthropic),
            &req.selection.model_id,
            req.web_search,
        );

        tracing::debug!(
            name: "llm.anthropic.request",
            model = %req.selection.model_id,
            web_search = req.web_search,
            "Starting Anthropic stream"
        );

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body(&req))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let (reporter, usage) = usage_channel();
        let parts = parts_from_sse(resp.bytes_stream(), MessagesParser::default(), reporter);
        Ok(ModelStream::new(parts, usage))
    }
}
