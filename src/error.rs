//! Error taxonomy shared by the job pipeline and the HTTP surface.
//!
//! [`ErrorKind`] is the wire-level classification carried in the `errorType`
//! field of `error` events and of structured HTTP error bodies. [`JobError`]
//! covers job-level failures that are reported as plain HTTP responses and
//! never as an opened-then-aborted stream.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::jobs::JobStoreError;
use crate::persistence::PersistenceError;

/// Classification of every failure a client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Provider credentials are missing; no network call was attempted.
    ConfigurationError,
    /// Malformed job-creation payload or malformed stored job record.
    InvalidParameters,
    /// Job id absent, expired, or owned by another caller.
    NotFound,
    /// The caller could not be identified.
    Unauthorized,
    /// The provider reported a generation failure mid-stream.
    StreamError,
    /// A provider-side tool (e.g. web search) failed mid-stream.
    StreamToolError,
    /// Anything unexpected: transport faults, adapter crashes, backend outages.
    InternalServerError,
}

impl ErrorKind {
    /// The wire spelling of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::InvalidParameters => "InvalidParameters",
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::StreamError => "StreamError",
            Self::StreamToolError => "StreamToolError",
            Self::InternalServerError => "InternalServerError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level failure surfaced to the caller as a structured HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    InvalidParameters(String),

    #[error("job not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("job store failure: {0}")]
    Store(#[from] JobStoreError),

    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl JobError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::NotFound => ErrorKind::NotFound,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Store(_) | Self::Persistence(_) => ErrorKind::InternalServerError,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Store(_) | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PersistenceError> for JobError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::ConversationNotFound(id) => {
                Self::InvalidParameters(format!("unknown conversation: {id}"))
            }
            PersistenceError::Backend(source) => Self::Persistence(source),
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Job request failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "errorType": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}
