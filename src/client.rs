//! # Orchestration Client
//!
//! Turns lifecycle transitions into container runtime calls and interprets
//! the results.
//!
//! | Call    | Runtime effect                                              |
//! |---------|-------------------------------------------------------------|
//! | `build` | temp context → `build_image` → [`BuildOutcome`]             |
//! | `run`   | remove `<prefix><tool>` if present → `run_container` → [`RunOutcome`] |
//! | `stop`  | `stop_container` then `remove_container` on `<prefix><tool>` |
//!
//! `build` and `run` never return an error: any driver failure becomes a
//! `Failure` outcome carrying whatever output was captured, and the caller
//! applies the matching terminal transition. `stop` surfaces its error,
//! including [`Error::ContainerNotFound`], to the caller. Nothing here
//! retries a driver call.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::constants::{CONTAINER_CAP_DROP, CONTAINER_SECURITY_OPTS, ENTRYPOINT_FILE, RUN_STARTED_LOG};
use crate::context::BuildContext;
use crate::driver::{ContainerDriver, ContainerName, ContainerSpec};
use crate::error::{Error, Result};
use crate::lifecycle::{BuildOutcome, RunOutcome};
use crate::model::{ToolId, VersionId};

/// Drives one container runtime on behalf of the lifecycle.
#[derive(Clone)]
pub struct OrchestrationClient {
    driver: Arc<dyn ContainerDriver>,
    config: Arc<OrchestratorConfig>,
}

impl OrchestrationClient {
    pub fn new(driver: Arc<dyn ContainerDriver>, config: Arc<OrchestratorConfig>) -> Self {
        Self { driver, config }
    }

    /// The underlying runtime driver.
    pub fn driver(&self) -> &Arc<dyn ContainerDriver> {
        &self.driver
    }

    // =========================================================================
    // Naming
    // =========================================================================

    /// Image tag for a version of a tool: `<prefix><tool>:v<version>`.
    pub fn image_tag(&self, tool_id: ToolId, version_id: VersionId) -> String {
        format!("{}{}:v{}", self.config.container_prefix, tool_id, version_id)
    }

    pub fn container_name(&self, tool_id: ToolId) -> Result<ContainerName> {
        ContainerName::for_tool(&self.config.container_prefix, tool_id)
    }

    /// Externally reachable path of a tool: `<path-prefix>/<tool>`.
    pub fn tool_url(&self, tool_id: ToolId) -> String {
        format!("{}/{}", self.config.path_prefix.trim_end_matches('/'), tool_id)
    }

    /// Reverse-proxy labels routing `tool_url` to the backend port.
    pub fn routing_labels(&self, tool_id: ToolId) -> BTreeMap<String, String> {
        let router = format!("traefik.http.routers.tool{}", tool_id);
        let service = format!("tool{}", tool_id);

        let mut labels = BTreeMap::new();
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            format!("{}.rule", router),
            format!("PathPrefix(`{}`)", self.tool_url(tool_id)),
        );
        labels.insert(
            format!("{}.entrypoints", router),
            self.config.proxy_entrypoint.clone(),
        );
        labels.insert(format!("{}.service", router), service.clone());
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", service),
            self.config.backend_port.to_string(),
        );
        labels
    }

    /// Command the tool container runs: the app served under its route.
    pub fn container_command(&self, tool_id: ToolId) -> Vec<String> {
        [
            "streamlit",
            "run",
            ENTRYPOINT_FILE,
            "--server.headless",
            "true",
            "--server.baseUrlPath",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            self.tool_url(tool_id),
            "--server.port".to_string(),
            self.config.backend_port.to_string(),
        ])
        .collect()
    }

    /// Full container spec with the fixed security posture.
    pub fn container_spec(&self, tool_id: ToolId, image_ref: &str) -> Result<ContainerSpec> {
        Ok(ContainerSpec {
            name: self.container_name(tool_id)?,
            image: image_ref.to_string(),
            command: self.container_command(tool_id),
            network: self.config.network().map(str::to_string),
            labels: self.routing_labels(tool_id),
            security_opts: CONTAINER_SECURITY_OPTS.iter().map(|s| s.to_string()).collect(),
            cap_drop: CONTAINER_CAP_DROP.iter().map(|s| s.to_string()).collect(),
        })
    }

    // =========================================================================
    // Runtime calls
    // =========================================================================

    /// Builds `source` + `manifest` into `<prefix><tool>:v<version>`.
    pub async fn build(
        &self,
        tool_id: ToolId,
        version_id: VersionId,
        source: &str,
        manifest: &str,
    ) -> BuildOutcome {
        let tag = self.image_tag(tool_id, version_id);

        let context = match BuildContext::create(&self.config.base_image, source, manifest) {
            Ok(context) => context,
            Err(e) => {
                warn!(%tool_id, image = %tag, "failed to prepare build context: {}", e);
                return BuildOutcome::Failure {
                    logs: vec![format!("failed to prepare build context: {}", e)],
                };
            }
        };

        match self.driver.build_image(context.path(), &tag).await {
            Ok(build) => {
                info!(%tool_id, %version_id, image = %tag, "image built");
                BuildOutcome::Success {
                    image_ref: tag,
                    logs: build.log_lines,
                }
            }
            Err(e) => {
                warn!(%tool_id, %version_id, image = %tag, "build failed: {}", e);
                let mut logs = e.logs().to_vec();
                logs.push(e.to_string());
                BuildOutcome::Failure { logs }
            }
        }
    }

    /// Starts `image_ref` as the tool's only container.
    pub async fn run(&self, tool_id: ToolId, image_ref: &str) -> RunOutcome {
        match self.replace_container(tool_id, image_ref).await {
            Ok(container_ref) => {
                let url = self.tool_url(tool_id);
                info!(%tool_id, image = image_ref, %url, "tool container started");
                RunOutcome::Success {
                    container_ref,
                    url,
                    logs: vec![RUN_STARTED_LOG.to_string()],
                }
            }
            Err(e) => {
                warn!(%tool_id, image = image_ref, "run failed: {}", e);
                RunOutcome::Failure {
                    logs: vec![e.to_string()],
                }
            }
        }
    }

    async fn replace_container(&self, tool_id: ToolId, image_ref: &str) -> Result<String> {
        let spec = self.container_spec(tool_id, image_ref)?;
        if self.driver.container_exists(&spec.name).await? {
            info!(container = %spec.name, "replacing existing container");
            match self.driver.remove_container(&spec.name, true).await {
                Ok(()) | Err(Error::ContainerNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.driver.run_container(&spec).await
    }

    /// Stops and removes the tool's container.
    ///
    /// # Errors
    ///
    /// [`Error::ContainerNotFound`] when no container carries the tool's name.
    pub async fn stop(&self, tool_id: ToolId) -> Result<()> {
        let name = self.container_name(tool_id)?;
        if !self.driver.container_exists(&name).await? {
            return Err(Error::ContainerNotFound(name.to_string()));
        }
        self.driver.stop_container(&name).await?;
        match self.driver.remove_container(&name, false).await {
            Ok(()) | Err(Error::ContainerNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        info!(%tool_id, container = %name, "tool container stopped");
        Ok(())
    }

    /// Force-removes the tool's container if one exists. Returns whether
    /// anything was removed.
    pub async fn remove(&self, tool_id: ToolId) -> Result<bool> {
        let name = self.container_name(tool_id)?;
        match self.driver.remove_container(&name, true).await {
            Ok(()) => Ok(true),
            Err(Error::ContainerNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
