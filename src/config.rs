//! Layered configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults (plus conventional provider key variables such as
//!    `OPENAI_API_KEY`)
//! 2. the config file: `--config` / `CONFIG_FILE`, else `./config.yaml` if
//!    present
//! 3. `RELAY_`-prefixed environment, `__` between sections
//!    (`RELAY_SERVER__PORT=8080`)
//! 4. CLI flags and their environment equivalents (`--port` / `PORT`)

use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::jobs::DEFAULT_TTL_SECONDS;
use crate::llm::{Provider, ProviderSettings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Require JWT authentication
    #[arg(long, env = "JWT_REQUIRED")]
    pub jwt_required: Option<bool>,

    /// Seconds an unconsumed job survives (0 = forever)
    #[arg(long, env = "JOB_TTL_SECONDS")]
    pub job_ttl_seconds: Option<u64>,

    /// Job store backend: memory or redis
    #[arg(long, env = "JOB_BACKEND")]
    pub job_backend: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub jobs: JobsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub jwt_required: bool,
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    pub ttl_seconds: u64,
    pub backend: JobBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Most models a single job may fan out to.
    pub max_targets: usize,
    /// How often the in-memory store evicts expired jobs.
    pub reaper_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderSettings,
    #[serde(default)]
    pub anthropic: ProviderSettings,
    #[serde(default)]
    pub google: ProviderSettings,
}

impl ProvidersConfig {
    #[must_use]
    pub fn get(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::OpenAI => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Google => &self.google,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub json_logs: bool,
    pub metrics_enabled: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("security.jwt_required", false)?
            .set_default("security.jwt_secret", "")?
            .set_default("jobs.ttl_seconds", DEFAULT_TTL_SECONDS)?
            .set_default("jobs.backend", "memory")?
            .set_default("jobs.max_targets", 8)?
            .set_default("jobs.reaper_interval_seconds", 30)?
            .set_default("telemetry.json_logs", false)?
            .set_default("telemetry.metrics_enabled", true)?;

        for provider in Provider::ALL {
            let key = provider
                .key_env_vars()
                .iter()
                .filter_map(|var| std::env::var(var).ok())
                .find(|v| !v.trim().is_empty());
            if let Some(key) = key {
                builder = builder.set_default(format!("providers.{provider}.api_key"), key)?;
            }
        }

        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::new("config.yaml", FileFormat::Yaml).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(required) = cli.jwt_required {
            builder = builder.set_override("security.jwt_required", required)?;
        }
        if let Some(ttl) = cli.job_ttl_seconds {
            builder = builder.set_override("jobs.ttl_seconds", ttl)?;
        }
        if let Some(backend) = cli.job_backend {
            builder = builder.set_override("jobs.backend", backend)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> Result<(), config::ConfigError> {
        if self.security.jwt_required && self.security.jwt_secret.is_empty() {
            return Err(config::ConfigError::Message(
                "security.jwt_secret is required when security.jwt_required is set".into(),
            ));
        }
        if self.jobs.backend == JobBackend::Redis && self.jobs.redis_url.is_none() {
            return Err(config::ConfigError::Message(
                "jobs.redis_url is required for the redis job backend".into(),
            ));
        }
        if self.jobs.max_targets == 0 {
            return Err(config::ConfigError::Message("jobs.max_targets must be positive".into()));
        }
        Ok(())
    }
}
