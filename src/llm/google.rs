//! Google Gemini adapter (`streamGenerateContent` with `alt=sse`).

use anyhow::Context;
use serde_json::{Value, json};

use super::sse::{FrameParser, SseFrame, parts_from_sse, provider_error, read_usage};
use super::{
    AdapterError, AdapterRequest, MessageRole, ModelClientAdapter, ModelStream, Provider,
    ProviderSettings, StreamPart, status_error, usage_channel,
};
use crate::normalized::Usage;

/// Adapter for the Gemini API.
#[derive(Clone)]
pub struct GoogleAdapter {
    http: reqwest::Client,
    settings: ProviderSettings,
}

impl std::fmt::Debug for GoogleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleAdapter")
            .field("settings", &self.settings)
            .finish()
    }
}

impl GoogleAdapter {
    #[must_use]
    pub fn new(http: reqwest::Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }
}

fn request_body(req: &AdapterRequest<'_>) -> Value {
    let contents: Vec<Value> = req
        .history
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let mut body = json!({ "contents": contents });
    if let Some(system) = req.system_prompt {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    let settings = &req.selection.settings;
    let mut generation = serde_json::Map::new();
    if let Some(t) = settings.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(n) = settings.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(n));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    if req.web_search {
        body["tools"] = json!([{ "google_search": {} }]);
    }
    body
}

/// Each chunk is a full `GenerateContentResponse`; usage metadata is
/// cumulative, so the last one seen wins.
#[derive(Debug, Default)]
struct GenerateParser {
    usage: Option<Usage>,
}

impl FrameParser for GenerateParser {
    fn parse(&mut self, frame: &SseFrame) -> anyhow::Result<Option<StreamPart>> {
        let v: Value = serde_json::from_str(&frame.data).context("malformed gemini chunk")?;

        if let Some(message) = provider_error(&v) {
            return Ok(Some(StreamPart::Error(message)));
        }
        if let Some(reason) = v["promptFeedback"]["blockReason"].as_str() {
            return Ok(Some(StreamPart::Error(format!("prompt blocked: {reason}"))));
        }
        if let Some(u) = v.get("usageMetadata").filter(|u| u.is_object()) {
            self.usage = Some(read_usage(
                u,
                "promptTokenCount",
                "candidatesTokenCount",
                "totalTokenCount",
            ));
        }

        let text: String = v["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();

        Ok((!text.is_empty()).then_some(StreamPart::TextDelta(text)))
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

#[async_trait::async_trait]
impl ModelClientAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn ensure_configured(&self) -> Result<(), AdapterError> {
        self.settings
            .key()
            .map(|_| ())
            .ok_or(AdapterError::Configuration(Provider::Google))
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn stream(&self, req: AdapterRequest<'_>) -> Result<ModelStream, AdapterError> {
        let key = self
            .settings
            .key()
            .ok_or(AdapterError::Configuration(Provider::Google))?;

        let url = Provider::Google.stream_url(
            self.settings.base_url_or(Provider::Google),
            &req.selection.model_id,
            req.web_search,
        );

        tracing::debug!(
            name: "llm.google.request",
            model = %req.selection.model_id,
            web_search = req.web_search,
            "Starting Gemini stream"
        );

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&request_body(&req))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let (reporter, usage) = usage_channel();
        let parts = parts_from_sse(resp.bytes_stream(), GenerateParser::default(), reporter);
        Ok(ModelStream::new(parts, usage))
    }
}
