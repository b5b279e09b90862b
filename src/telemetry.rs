//! Logging and metrics setup.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the default filter `info,model_relay=debug`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(json_logs: bool) {
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,model_relay=debug"));

    let registry = tracing_subscriber::registry().with(filter_layer);
    let result = if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Install the Prometheus recorder once and return its handle.
///
/// Returns `None` if some other recorder was installed first.
pub fn install_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return PROMETHEUS_HANDLE.get().cloned();
    }

    describe_metrics();
    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle).clone();
    tracing::info!(name: "telemetry.metrics.installed", "Prometheus metrics initialized");
    Some(handle)
}

fn describe_metrics() {
    describe_counter!("relay_jobs_created_total", "Jobs accepted by the create endpoint");
    describe_counter!("relay_jobs_streamed_total", "Jobs whose stream was opened");
    describe_counter!(
        "relay_jobs_not_found_total",
        "Stream requests for absent, expired, foreign, or busy jobs"
    );
    describe_counter!(
        "relay_target_outcomes_total",
        "Settled targets by provider and outcome"
    );
    describe_histogram!(
        "relay_first_token_latency_ms",
        "Milliseconds from stream start to the first text delta"
    );
}
