//! Container runtime driver interface.
//!
//! The driver is the only component that talks to the container runtime.
//! It knows nothing about tools, builds or runs; it builds tagged images
//! from a context directory and manages containers by name.
//!
//! # Identity
//!
//! [`ContainerName`] is the single place a tool's container name is derived.
//! The name depends on the tool id alone, so every `run` for a tool targets
//! the same name and at most one container can be addressable per tool.
//!
//! # Implementations
//!
//! - [`DockerDriver`]: drives the `docker` (or compatible) CLI.

mod docker;

pub use docker::DockerDriver;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::validate_container_name;
use crate::error::{Error, Result};
use crate::model::ToolId;

// =============================================================================
// Container identity
// =============================================================================

/// Deterministic per-tool container name: `<prefix><tool-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Derives the container name for `tool_id`.
    pub fn for_tool(prefix: &str, tool_id: ToolId) -> Result<Self> {
        let name = format!("{}{}", prefix, tool_id);
        validate_container_name(&name).map_err(|reason| Error::InvalidConfig {
            field: "container_prefix".to_string(),
            reason: reason.to_string(),
        })?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Everything needed to start one tool container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image: String,
    pub command: Vec<String>,
    /// Network to join; `None` keeps the runtime default.
    pub network: Option<String>,
    /// Reverse-proxy routing labels.
    pub labels: BTreeMap<String, String>,
    pub security_opts: Vec<String>,
    pub cap_drop: Vec<String>,
}

/// Output of a successful image build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBuild {
    /// Every build-step output line, in order.
    pub log_lines: Vec<String>,
}

// =============================================================================
// Driver trait
// =============================================================================

/// Container runtime operations used by the orchestration client.
///
/// # Errors
///
/// - `build_image` returns [`Error::BuildFailed`] with the partial output when
///   any build step exits non-zero.
/// - `stop_container` and `remove_container` return
///   [`Error::ContainerNotFound`] when no container has that name.
/// - Every operation returns [`Error::RuntimeUnavailable`] when the runtime
///   cannot be reached and [`Error::Timeout`] when it does not answer in time.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Probes the runtime; `Err` carries the reason it is unusable.
    async fn check_available(&self) -> Result<()>;

    /// Builds `context` (which holds a `Dockerfile`) and tags the image `tag`.
    async fn build_image(&self, context: &Path, tag: &str) -> Result<ImageBuild>;

    /// Returns true if a container named `name` exists in any state.
    async fn container_exists(&self, name: &ContainerName) -> Result<bool>;

    /// Creates and starts a detached container; returns the runtime's container id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Stops a running container.
    async fn stop_container(&self, name: &ContainerName) -> Result<()>;

    /// Removes a container; `force` kills it first if running.
    async fn remove_container(&self, name: &ContainerName, force: bool) -> Result<()>;
}
