//! Error types for the SDK.

use thiserror::Error;

/// SDK error type.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    #[cfg(feature = "http-client")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// `error` field of the response, or the raw body.
        message: String,
        /// `errorType` field of the response, when present.
        error_type: Option<String>,
    },

    /// Configuration error (embedded mode).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime error (embedded mode).
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Build an [`Error::Api`] from a status and response body.
    pub fn api(status: u16, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        Self::Api {
            status,
            message: field("error").unwrap_or_else(|| body.to_string()),
            error_type: field("errorType"),
        }
    }
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, Error>;
