//! Model Relay server.
//!
//! Entry point: load configuration, install telemetry, serve.

use std::sync::Arc;

use dotenvy::dotenv;
use mimalloc::MiMalloc;

use model_relay::config::AppConfig;
use model_relay::{server, telemetry};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let config = match AppConfig::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    telemetry::init(config.telemetry.json_logs);

    tracing::info!(
        name: "config.loaded",
        port = config.server.port,
        job_backend = ?config.jobs.backend,
        job_ttl_seconds = config.jobs.ttl_seconds,
        jwt_required = config.security.jwt_required,
        "Configuration loaded"
    );

    server::start_server(config).await
}
