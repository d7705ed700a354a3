//! Orchestrator configuration.
//!
//! A single [`OrchestratorConfig`] is built at process start and shared as an
//! `Arc` with every component that needs it. Values are layered:
//!
//! ```text
//! Default  ──▶  JSON file (optional)  ──▶  environment overrides
//! ```
//!
//! | Variable               | Field              |
//! |------------------------|--------------------|
//! | `SHEETIFY_RUNTIME`     | `runtime_binary`   |
//! | `SHEETIFY_BASE_IMAGE`  | `base_image`       |
//! | `TRAEFIK_NETWORK`      | `routing_network`  |
//! | `TRAEFIK_ENTRYPOINT`   | `proxy_entrypoint` |
//! | `SHEETIFY_BACKEND_PORT`| `backend_port`     |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    CONTAINER_NAME_VALID_CHARS, DEFAULT_BACKEND_PORT, DEFAULT_BASE_IMAGE, DEFAULT_BUILD_TIMEOUT,
    DEFAULT_CONTAINER_PREFIX, DEFAULT_MAX_JOB_ATTEMPTS, DEFAULT_MAX_LOG_BYTES, DEFAULT_PATH_PREFIX,
    DEFAULT_PROXY_ENTRYPOINT, DEFAULT_ROUTING_NETWORK, DEFAULT_RUNTIME_BINARY, DEFAULT_RUN_TIMEOUT,
    DEFAULT_STOP_TIMEOUT, MAX_UPLOAD_SIZE, validate_image_ref,
};
use crate::error::{Error, Result};

/// Explicit configuration for every orchestrator component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Container runtime CLI (`docker`, `podman`).
    pub runtime_binary: String,
    /// Image every tool image is layered on.
    pub base_image: String,
    /// Shared network the reverse proxy watches. Empty disables `--network`.
    pub routing_network: String,
    /// Reverse-proxy entrypoint referenced by router labels.
    pub proxy_entrypoint: String,
    /// Port the tool's web server listens on inside the container.
    pub backend_port: u16,
    /// External path prefix; tools are reachable at `<prefix>/<tool-id>`.
    pub path_prefix: String,
    /// Prefix for container names and image repositories.
    pub container_prefix: String,
    /// Image build deadline, seconds.
    pub build_timeout_secs: u64,
    /// Container start deadline, seconds.
    pub run_timeout_secs: u64,
    /// Container stop deadline, seconds.
    pub stop_timeout_secs: u64,
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: usize,
    /// Cap on stored log text per Build/Run.
    pub max_log_bytes: usize,
    /// Deliveries per job before the dispatcher gives up on an infrastructure fault.
    pub max_job_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runtime_binary: DEFAULT_RUNTIME_BINARY.to_string(),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            routing_network: DEFAULT_ROUTING_NETWORK.to_string(),
            proxy_entrypoint: DEFAULT_PROXY_ENTRYPOINT.to_string(),
            backend_port: DEFAULT_BACKEND_PORT,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT.as_secs(),
            run_timeout_secs: DEFAULT_RUN_TIMEOUT.as_secs(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT.as_secs(),
            max_upload_bytes: MAX_UPLOAD_SIZE,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            max_job_attempts: DEFAULT_MAX_JOB_ATTEMPTS,
        }
    }
}

impl OrchestratorConfig {
    /// Loads defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Applies overrides from a variable lookup (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SHEETIFY_RUNTIME") {
            self.runtime_binary = value;
        }
        if let Some(value) = lookup("SHEETIFY_BASE_IMAGE") {
            self.base_image = value;
        }
        if let Some(value) = lookup("TRAEFIK_NETWORK") {
            self.routing_network = value;
        }
        if let Some(value) = lookup("TRAEFIK_ENTRYPOINT") {
            self.proxy_entrypoint = value;
        }
        if let Some(value) = lookup("SHEETIFY_BACKEND_PORT") {
            self.backend_port = value.parse().map_err(|_| Error::InvalidConfig {
                field: "backend_port".to_string(),
                reason: format!("'{}' is not a port number", value),
            })?;
        }
        Ok(())
    }

    /// Rejects values that would produce unusable runtime invocations.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: impl Into<String>) -> Error {
            Error::InvalidConfig {
                field: field.to_string(),
                reason: reason.into(),
            }
        }

        if self.runtime_binary.trim().is_empty() {
            return Err(invalid("runtime_binary", "cannot be empty"));
        }
        validate_image_ref(&self.base_image).map_err(|r| invalid("base_image", r))?;
        if !self
            .routing_network
            .chars()
            .all(|c| CONTAINER_NAME_VALID_CHARS.contains(c))
        {
            return Err(invalid("routing_network", "contains invalid characters"));
        }
        if self.proxy_entrypoint.is_empty() {
            return Err(invalid("proxy_entrypoint", "cannot be empty"));
        }
        if self.backend_port == 0 {
            return Err(invalid("backend_port", "must be non-zero"));
        }
        if !self.path_prefix.starts_with('/') || self.path_prefix.ends_with('/') {
            return Err(invalid(
                "path_prefix",
                "must start with '/' and not end with '/'",
            ));
        }
        if self.container_prefix.is_empty()
            || !self
                .container_prefix
                .chars()
                .all(|c| CONTAINER_NAME_VALID_CHARS.contains(c))
        {
            return Err(invalid("container_prefix", "must be a valid name prefix"));
        }
        if self.build_timeout_secs == 0 || self.run_timeout_secs == 0 || self.stop_timeout_secs == 0
        {
            return Err(invalid("timeouts", "must be non-zero"));
        }
        if self.max_job_attempts == 0 {
            return Err(invalid("max_job_attempts", "must be at least 1"));
        }
        Ok(())
    }

    /// Image build deadline.
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Container start deadline.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Container stop deadline.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Routing network, or `None` when routing is disabled.
    pub fn network(&self) -> Option<&str> {
        if self.routing_network.is_empty() {
            None
        } else {
            Some(&self.routing_network)
        }
    }
}
