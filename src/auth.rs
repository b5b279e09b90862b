//! Caller identity.
//!
//! The relay does not own users; it asks an [`IdentityValidator`] who is
//! calling and treats an invalid answer as unauthorized. The default
//! validator checks HS256 bearer tokens and, unless tokens are required,
//! lets unauthenticated callers through as [`CallerId::anonymous`].

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::JobError;

/// Opaque identity of whoever creates and streams a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity shared by all unauthenticated callers.
    #[must_use]
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves request headers to a caller, or `None` if the request is not
/// authorized.
pub trait IdentityValidator: Send + Sync + std::fmt::Debug {
    fn validate(&self, headers: &HeaderMap) -> Option<CallerId>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Caller id (subject).
    pub sub: String,
    pub name: Option<String>,
    /// Expiration time (UNIX timestamp).
    pub exp: usize,
}

/// Bearer-token validator for HS256 JWTs.
///
/// With an empty secret no token can be verified, so any bearer token is
/// rejected instead of being decoded against an empty HMAC key.
pub struct JwtValidator {
    key: Option<DecodingKey>,
    validation: Validation,
    required: bool,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("required", &self.required)
            .field("accepts_tokens", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

impl JwtValidator {
    pub fn new(secret: &str, required: bool) -> Self {
        Self {
            key: (!secret.is_empty()).then(|| DecodingKey::from_secret(secret.as_bytes())),
            validation: Validation::default(),
            required,
        }
    }
}

impl IdentityValidator for JwtValidator {
    fn validate(&self, headers: &HeaderMap) -> Option<CallerId> {
        let header_val = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok());

        let Some(token) = header_val.and_then(|h| h.strip_prefix("Bearer ")) else {
            return (!self.required).then(CallerId::anonymous);
        };

        let Some(key) = &self.key else {
            tracing::debug!(name: "auth.rejected", "Bearer token sent but no jwt_secret is configured");
            return None;
        };

        match decode::<Claims>(token, key, &self.validation) {
            Ok(data) => Some(CallerId::new(data.claims.sub)),
            Err(e) => {
                tracing::debug!(name: "auth.rejected", error = %e, "Rejected bearer token");
                None
            }
        }
    }
}

/// Resolve the caller and stash it as a request extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, JobError> {
    let caller = state
        .identity
        .validate(request.headers())
        .ok_or(JobError::Unauthorized)?;

    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

/// Build the validator described by the security configuration.
pub fn validator_from_config(security: &crate::config::SecurityConfig) -> Arc<dyn IdentityValidator> {
    Arc::new(JwtValidator::new(&security.jwt_secret, security.jwt_required))
}
