//! Model Relay
//!
//! A streaming job orchestration service: one request fans out to one or
//! more LLM backends, and every backend's output is pushed incrementally to
//! the caller over a single server-sent event stream.
//!
//! # Architecture
//!
//! - **Jobs**: a TTL-bounded, read-once handoff between "create" and "stream"
//! - **Adapters**: one [`llm::ModelClientAdapter`] per provider, normalizing
//!   provider output into text deltas, errors, and a usage total
//! - **Driver / Orchestrator**: one driver per target, all writing to one
//!   shared sink; settle-all, with per-target failure isolation
//! - **Wire protocol**: five event kinds tagged by target id
//!
//! # Modules
//!
//! - [`jobs`]: job payloads, stores, and the lifecycle controller
//! - [`llm`]: adapters, the stream driver, and the fan-out orchestrator
//! - [`normalized`]: event taxonomy and SSE framing
//! - [`sink`]: event sinks
//! - [`server`]: HTTP routes

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod normalized;
pub mod persistence;
pub mod server;
pub mod sink;
pub mod telemetry;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::IdentityValidator;
use crate::config::AppConfig;
use crate::jobs::JobController;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Job lifecycle controller.
    pub jobs: Arc<JobController>,
    /// Identity collaborator consulted before every job request.
    pub identity: Arc<dyn IdentityValidator>,
    /// Prometheus handle, when metrics are enabled.
    pub metrics: Option<PrometheusHandle>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("jobs", &self.jobs)
            .field("identity", &self.identity)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}
