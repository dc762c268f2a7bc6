use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Root scanned for `model-settings.json` files.
    pub model_repository: PathBuf,
    pub load_models_at_startup: bool,
    /// Size of the rayon pool used for row-parallel scoring.
    pub parallel_workers: usize,
    /// Comment frames sent on idle event streams; 0 disables them.
    pub stream_keepalive_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, applying defaults for
    /// missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let parallel_workers = match lookup("PARALLEL_WORKERS") {
            Some(workers) => workers
                .parse()
                .with_context(|| format!("PARALLEL_WORKERS must be a positive integer, got '{}'", workers))?,
            None => num_cpus::get(),
        };
        if parallel_workers == 0 {
            return Err(anyhow::anyhow!("PARALLEL_WORKERS must be at least 1"));
        }

        let load_models_at_startup = match var("LOAD_MODELS_AT_STARTUP", "true").to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(anyhow::anyhow!(
                    "LOAD_MODELS_AT_STARTUP must be a boolean, got '{}'",
                    other
                ))
            }
        };

        Ok(Self {
            host: var("MODELHOST_HOST", "127.0.0.1"),
            port: var("MODELHOST_PORT", "8080")
                .parse()
                .context("MODELHOST_PORT must be a port number")?,
            model_repository: PathBuf::from(var("MODEL_REPOSITORY", ".")),
            load_models_at_startup,
            parallel_workers,
            stream_keepalive_seconds: var("STREAM_KEEPALIVE_SECONDS", "15")
                .parse()
                .context("STREAM_KEEPALIVE_SECONDS must be an integer")?,
            request_timeout_seconds: var("REQUEST_TIMEOUT_SECONDS", "300")
                .parse()
                .context("REQUEST_TIMEOUT_SECONDS must be an integer")?,
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.host, self.port);
        info!("- Model Repository: {}", self.model_repository.display());
        info!("- Load Models At Startup: {}", self.load_models_at_startup);
        info!("- Parallel Workers: {}", self.parallel_workers);
        info!("- Stream Keepalive: {}s", self.stream_keepalive_seconds);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
