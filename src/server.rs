//! HTTP surface.
//!
//! | Method | Path                      | |
//! |--------|---------------------------|-|
//! | POST   | `/api/jobs`               | create a job, returns `{uid, conversationId?}` |
//! | GET    | `/api/jobs/stream?uid=…`  | stream a job as server-sent events |
//! | GET    | `/health`                 | liveness |
//! | GET    | `/metrics`                | Prometheus text format, when enabled |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::auth::{CallerId, auth_middleware, validator_from_config};
use crate::bus::BroadcastBus;
use crate::config::{AppConfig, JobBackend};
use crate::error::JobError;
use crate::jobs::{CreatedJob, InMemoryJobStore, JobController, JobRequest, JobStore};
use crate::llm::{AdapterRegistry, Orchestrator};
use crate::persistence::InMemoryPersistence;
use crate::sink::{ChannelSink, sse_frames};
use crate::telemetry;

/// Events buffered between the drivers and the socket before producers wait.
pub const SINK_CAPACITY: usize = 64;

/// Build the router for `state`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/stream", get(stream_job))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire up state from configuration: provider adapters, the configured job
/// store, and in-memory collaborators.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let registry = AdapterRegistry::from_config(&config.providers, &http);
    let store = job_store(&config).await?;
    Ok(assemble_state(config, registry, store))
}

/// Assemble state around an explicit adapter registry and job store.
pub fn assemble_state(
    config: Arc<AppConfig>,
    registry: AdapterRegistry,
    store: Arc<dyn JobStore>,
) -> AppState {
    let controller = JobController::new(
        store,
        Arc::new(InMemoryPersistence::new()),
        Orchestrator::new(Arc::new(registry)),
        Arc::new(BroadcastBus::default()),
        config.jobs.max_targets,
    );
    let metrics = if config.telemetry.metrics_enabled {
        telemetry::install_metrics()
    } else {
        None
    };

    AppState {
        jobs: Arc::new(controller),
        identity: validator_from_config(&config.security),
        metrics,
        config,
    }
}

async fn job_store(config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let ttl = config.jobs.ttl_seconds;
    match config.jobs.backend {
        JobBackend::Memory => {
            let store = InMemoryJobStore::new(ttl);
            if ttl > 0 {
                store.spawn_reaper(Duration::from_secs(
                    config.jobs.reaper_interval_seconds.max(1),
                ));
            }
            info!(name: "jobs.store.selected", backend = "memory", ttl_seconds = ttl, "Job store ready");
            Ok(Arc::new(store))
        }
        JobBackend::Redis => redis_store(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_store(config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let url = config
        .jobs
        .redis_url
        .as_deref()
        .context("jobs.redis_url is required for the redis backend")?;
    let store = crate::jobs::RedisJobStore::connect(url, config.jobs.ttl_seconds).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    anyhow::bail!("jobs.backend = redis requires building with the `redis` feature")
}

/// Serve `state` on an already bound listener until ctrl-c.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Start the server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(Arc::clone(&config)).await?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve(listener, state).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(name: "server.shutdown", "Shutting down");
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/jobs - Validate and park a job.
async fn create_job(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerId>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<CreatedJob>, JobError> {
    let Json(request) = payload.map_err(|e| JobError::InvalidParameters(e.body_text()))?;
    let created = state.jobs.create_job(&caller, request).await?;
    Ok(Json(created))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    uid: String,
}

/// GET /api/jobs/stream?uid=… - Stream a job's events.
///
/// Job-level failures are answered as plain JSON errors; the event stream is
/// only opened once the job has been claimed.
async fn stream_job(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerId>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Response, JobError> {
    let Query(StreamQuery { uid }) =
        query.map_err(|e| JobError::InvalidParameters(e.body_text()))?;
    let job = state.jobs.open_job(&uid, &caller).await?;

    let (sink, rx) = ChannelSink::bounded(SINK_CAPACITY);
    let cancel = CancellationToken::new();

    let jobs = Arc::clone(&state.jobs);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        jobs.stream_job(job, Arc::new(sink), task_cancel).await;
    });

    let body = Body::from_stream(sse_frames(rx, cancel.drop_guard()));
    Ok(build_sse_response(body))
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /metrics
async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn build_sse_response(body: Body) -> Response {
    let mut resp = Response::new(body);
    let h = resp.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    resp
}
