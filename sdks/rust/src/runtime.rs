//! Embeddable runtime for the SDK.
//!
//! This module allows embedding the relay server in another Rust application.
//! Enable with `features = ["embedded"]`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use model_relay::{AppState, config::AppConfig, jobs::JobController, server};

use crate::error::{Error, Result};

/// Embeddable runtime that replicates the standalone server behavior.
///
/// # Example
///
/// ```rust,ignore
/// use model_relay_sdk::Runtime;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runtime = Runtime::builder()
///         .config_path("config.yaml")
///         .build()
///         .await?;
///
///     // Option 1: serve HTTP until ctrl-c
///     runtime.start().await?;
///
///     // Option 2: drive jobs directly
///     let jobs = runtime.jobs();
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Runtime {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Runtime {
    /// Create a new runtime builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Serve on the configured host and port until ctrl-c.
    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Runtime(format!("failed to bind {addr}: {e}")))?;
        server::serve(listener, self.state.clone())
            .await
            .map_err(|e| Error::Runtime(e.to_string()))
    }

    /// Serve on an ephemeral localhost port in the background.
    ///
    /// Returns the bound address, suitable for [`crate::Client::new`], and
    /// the server task. The task resolves only if the server stops; await it
    /// to see why, or abort it to shut the server down.
    pub async fn spawn_local(&self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            server::serve(listener, state)
                .await
                .map_err(|e| Error::Runtime(e.to_string()))
        });
        Ok((addr, handle))
    }

    /// Get a reference to the application configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Get a reference to the internal AppState for direct API access.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Access the job controller directly.
    pub fn jobs(&self) -> Arc<JobController> {
        Arc::clone(&self.state.jobs)
    }
}

/// Builder for creating a Runtime.
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config_path: Option<String>,
    config: Option<AppConfig>,
}

impl RuntimeBuilder {
    /// Set the path to the configuration file.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Provide a configuration directly (instead of loading from file).
    #[must_use]
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the runtime: load configuration if none was given, then wire
    /// up adapters and the job store.
    pub async fn build(self) -> Result<Runtime> {
        let config = match (self.config, self.config_path) {
            (Some(c), _) => c,
            (None, Some(path)) => AppConfig::load_from_args(["model-relay", "--config", path.as_str()])
                .map_err(|e| Error::Config(e.to_string()))?,
            (None, None) => AppConfig::load_from_args(["model-relay"])
                .map_err(|e| Error::Config(e.to_string()))?,
        };
        let config = Arc::new(config);
        let state = server::build_state(Arc::clone(&config))
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;

        Ok(Runtime { config, state })
    }
}
