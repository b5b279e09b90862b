//! Provider identities, connection settings, and endpoint construction.

use serde::{Deserialize, Serialize};

/// Supported model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// `OpenAI` (api.openai.com) or any Chat Completions compatible server
    OpenAI,
    /// Anthropic Messages API
    Anthropic,
    /// Google Gemini API
    Google,
}

impl Provider {
    /// All providers, in registry order.
    pub const ALL: [Provider; 3] = [Self::OpenAI, Self::Anthropic, Self::Google];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Default API base URL.
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Google => "https://generativelanguage.googleapis.com",
        }
    }

    /// Conventional environment variables holding this provider's API key.
    #[must_use]
    pub fn key_env_vars(self) -> &'static [&'static str] {
        match self {
            Self::OpenAI => &["OPENAI_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Google => &["GOOGLE_GENERATIVE_AI_API_KEY", "GEMINI_API_KEY"],
        }
    }

    /// Build the streaming endpoint for this provider.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL (trailing slash tolerated)
    /// * `model` - Model id; only part of the path for Google
    /// * `web_search` - `OpenAI` switches to the Responses API for web search
    #[must_use]
    pub fn stream_url(self, base_url: &str, model: &str, web_search: bool) -> String {
        let base = base_url.trim_end_matches('/');

        match self {
            Self::OpenAI if web_search => format!("{base}/v1/responses"),
            Self::OpenAI => format!("{base}/v1/chat/completions"),
            Self::Anthropic => format!("{base}/v1/messages"),
            Self::Google => {
                format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
            }
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for one provider.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderSettings {
    /// API key; `None` or blank means the provider is not configured.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override; empty means the provider default.
    #[serde(default)]
    pub base_url: String,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ProviderSettings {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into(),
        }
    }

    /// The API key if one is set and non-blank.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Base URL, falling back to the provider default.
    #[must_use]
    pub fn base_url_or(&self, provider: Provider) -> &str {
        if self.base_url.trim().is_empty() {
            provider.default_base_url()
        } else {
            &self.base_url
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_wire_names() {
        let p: Provider = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(p, Provider::OpenAI);
        let p: Provider = serde_json::from_str("\"google\"").unwrap();
        assert_eq!(p, Provider::Google);
        assert_eq!(serde_json::to_string(&Provider::Anthropic).unwrap(), "\"anthropic\"");
    }

    #[test]
    fn test_build_url_openai() {
        let url = Provider::OpenAI.stream_url("https://api.openai.com/", "gpt-4o", false);
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
        let url = Provider::OpenAI.stream_url("https://api.openai.com", "gpt-4o", true);
        assert_eq!(url, "https://api.openai.com/v1/responses");
    }

    #[test]
    fn test_build_url_google() {
        let url = Provider::Google.stream_url(
            "https://generativelanguage.googleapis.com",
            "gemini-2.0-flash",
            false,
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_blank_key_is_missing() {
        let settings = ProviderSettings::new(Some("   ".into()), "");
        assert!(settings.key().is_none());
        assert_eq!(
            settings.base_url_or(Provider::Anthropic),
            "https://api.anthropic.com"
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let settings = ProviderSettings::new(Some("sk-secret".into()), "");
        assert!(!format!("{settings:?}").contains("sk-secret"));
    }
}
