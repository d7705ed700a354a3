//! # Tool Lifecycle Orchestrator
//!
//! Ties the pieces together:
//!
//! ```text
//!  control plane                         worker (dispatcher)
//!  ─────────────                         ───────────────────
//!  request_build ─┐                      handle(Build) ─▶ client.build ─┐
//!  request_run   ─┼─▶ Store::commit ─▶   handle(Run)   ─▶ client.run   ─┼─▶ Store::commit
//!  request_stop  ─┘    + enqueue         handle(Stop)  ─▶ client.stop  ─┘
//! ```
//!
//! Commands check preconditions against the stored entities, commit the
//! in-progress marker and enqueue a job; they never wait for the runtime.
//! Job handlers call the runtime and apply the terminal transition in the
//! same task.
//!
//! ## Re-delivery
//!
//! Jobs may be delivered more than once. Handlers read the current records
//! first and skip work that has already settled:
//!
//! | Job   | Skipped when                          |
//! |-------|---------------------------------------|
//! | Build | build is Success or Failed            |
//! | Run   | run is no longer Starting             |
//! | Stop  | tool is no longer Running             |
//!
//! Every terminal write goes through an optimistic commit; on a conflict the
//! handler re-reads and recomputes, up to [`MAX_COMMIT_ATTEMPTS`] times.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::OrchestrationClient;
use crate::config::OrchestratorConfig;
use crate::constants::{MAX_COMMIT_ATTEMPTS, RUN_STOPPED_LOG};
use crate::dispatch::{Dispatcher, Job, JobHandler, JobId};
use crate::driver::ContainerDriver;
use crate::error::{Error, Result};
use crate::lifecycle::{
    BuildOutcome, RunOutcome, StopDecision, authorize, begin_build, begin_run, begin_stop,
    complete_build, complete_run, complete_stop, start_build, supersede_runs,
};
use crate::model::{
    Build, BuildId, BuildStatus, NewTool, NewVersion, OwnerId, Run, RunId, RunStatus, Tool,
    ToolId, Version, VersionId,
};
use crate::packaging;
use crate::store::{BuildChange, RunChange, Store, Transition};

// =============================================================================
// Command results
// =============================================================================

/// How an accepted command proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceptance {
    /// Build job queued.
    Queued,
    /// Run job queued.
    Starting,
    /// Stop job queued.
    Stopping,
    /// Nothing to do; no job queued.
    Ignored,
}

/// Verdict returned by an accepted command. Rejections are `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub status: Acceptance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<BuildId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl CommandReceipt {
    fn new(status: Acceptance, job_id: Option<JobId>) -> Self {
        Self {
            status,
            job_id,
            build_id: None,
            run_id: None,
        }
    }
}

/// A version with every build made from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionDetail {
    #[serde(flatten)]
    pub version: Version,
    pub builds: Vec<Build>,
}

/// A tool with its versions and runs, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDetail {
    #[serde(flatten)]
    pub tool: Tool,
    pub versions: Vec<VersionDetail>,
    pub runs: Vec<Run>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Control-plane commands and the job handler behind them.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn Store>,
    client: OrchestrationClient,
    dispatcher: Arc<dyn Dispatcher>,
}

fn missing(entity: &'static str, id: impl ToString) -> Error {
    Error::EntityNotFound {
        entity,
        id: id.to_string(),
    }
}

impl Orchestrator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<dyn Store>,
        driver: Arc<dyn ContainerDriver>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let client = OrchestrationClient::new(driver, Arc::clone(&config));
        Self {
            config,
            store,
            client,
            dispatcher,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn client(&self) -> &OrchestrationClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn owned_tool(&self, owner: OwnerId, tool_id: ToolId) -> Result<Tool> {
        authorize(self.store.tool(tool_id).await?, owner)
    }

    // =========================================================================
    // Tool management
    // =========================================================================

    pub async fn create_tool(
        &self,
        owner: OwnerId,
        name: &str,
        description: Option<String>,
    ) -> Result<Tool> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::precondition("Tool name required"));
        }
        let tool = self
            .store
            .insert_tool(NewTool {
                owner,
                name: name.to_string(),
                description,
            })
            .await?;
        info!(tool_id = %tool.id, owner = %owner, "tool created");
        Ok(tool)
    }

    /// Returns the tool if `owner` owns it, else [`Error::ToolNotFound`].
    pub async fn get_tool(&self, owner: OwnerId, tool_id: ToolId) -> Result<Tool> {
        self.owned_tool(owner, tool_id).await
    }

    pub async fn tool_detail(&self, owner: OwnerId, tool_id: ToolId) -> Result<ToolDetail> {
        let tool = self.owned_tool(owner, tool_id).await?;
        let mut versions = Vec::new();
        for version in self.store.versions_for_tool(tool.id).await? {
            let builds = self.store.builds_for_version(version.id).await?;
            versions.push(VersionDetail { version, builds });
        }
        let runs = self.store.runs_for_tool(tool.id).await?;
        Ok(ToolDetail {
            tool,
            versions,
            runs,
        })
    }

    /// Removes the tool's container (if any), then the tool and everything it owns.
    pub async fn delete_tool(&self, owner: OwnerId, tool_id: ToolId) -> Result<()> {
        let tool = self.owned_tool(owner, tool_id).await?;
        if self.client.remove(tool.id).await? {
            info!(tool_id = %tool.id, "removed tool container");
        }
        self.store.delete_tool(tool.id).await?;
        info!(tool_id = %tool.id, "tool deleted");
        Ok(())
    }

    /// Validates an upload and records it as a new immutable Version.
    ///
    /// Nothing is stored when validation fails.
    pub async fn upload_version(
        &self,
        owner: OwnerId,
        tool_id: ToolId,
        filename: &str,
        data: &[u8],
        metadata: Option<serde_json::Value>,
    ) -> Result<Version> {
        let tool = self.owned_tool(owner, tool_id).await?;
        let packaged = packaging::validate_with_limit(filename, data, self.config.max_upload_bytes)
            .map_err(|e| {
                info!(tool_id = %tool.id, filename, "upload rejected: {}", e);
                e
            })?;

        let version = self
            .store
            .insert_version(NewVersion {
                tool_id: tool.id,
                digest: packaged.digest(),
                source: packaged.source,
                manifest: packaged.manifest,
                metadata,
            })
            .await?;
        info!(
            tool_id = %tool.id,
            version_id = %version.id,
            manifest = ?packaged.manifest_origin,
            "version uploaded"
        );
        Ok(version)
    }

    // =========================================================================
    // Lifecycle commands
    // =========================================================================

    async fn resolve_version(&self, tool: &Tool, version_id: Option<VersionId>) -> Result<Option<Version>> {
        match version_id {
            Some(id) => match self.store.version(id).await? {
                Some(version) => Ok(Some(version)),
                None => Err(Error::precondition("Invalid version")),
            },
            None => self.store.latest_version(tool.id).await,
        }
    }

    /// `RequestBuild`: marks the tool Building, creates a Pending build and
    /// queues it. Without `version_id` the most recent upload is built.
    pub async fn request_build(
        &self,
        owner: OwnerId,
        tool_id: ToolId,
        version_id: Option<VersionId>,
    ) -> Result<CommandReceipt> {
        let mut attempt = 0;
        let committed = loop {
            attempt += 1;
            let tool = self.owned_tool(owner, tool_id).await?;
            let version = self.resolve_version(&tool, version_id).await?;
            let (next_tool, new_build) = begin_build(&tool, version.as_ref())?;
            let transition = Transition::new()
                .with_tool(next_tool)
                .with_build(BuildChange::Create(new_build));
            match self.store.commit(transition).await {
                Ok(committed) => break committed,
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(%tool_id, attempt, "build request raced, re-reading");
                }
                Err(e) => return Err(e),
            }
        };
        let tool = committed.tool.ok_or_else(|| missing("tool", tool_id))?;
        let build = committed.build.ok_or_else(|| missing("build", tool_id))?;

        let job = Job::Build {
            tool_id,
            build_id: build.id,
        };
        match self.dispatcher.enqueue(job).await {
            Ok(job_id) => {
                info!(%tool_id, build_id = %build.id, version_id = %build.version_id, %job_id, "build queued");
                let mut receipt = CommandReceipt::new(Acceptance::Queued, Some(job_id));
                receipt.build_id = Some(build.id);
                Ok(receipt)
            }
            Err(e) => {
                self.abandon_build(&tool, &build, &e).await;
                Err(e)
            }
        }
    }

    /// Settles a build that never reached the queue so the tool is not left Building.
    async fn abandon_build(&self, tool: &Tool, build: &Build, cause: &Error) {
        let outcome = BuildOutcome::Failure {
            logs: vec![format!("dispatch failed: {}", cause)],
        };
        let settled = start_build(build)
            .and_then(|running| complete_build(tool, &running, &outcome, self.config.max_log_bytes));
        let result = match settled {
            Ok((next_tool, next_build)) => {
                self.store
                    .commit(
                        Transition::new()
                            .with_tool(next_tool)
                            .with_build(BuildChange::Update(next_build)),
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(tool_id = %tool.id, build_id = %build.id, "failed to settle undispatched build: {}", e);
        }
    }

    /// `RequestRun`: creates a Starting run from the build behind the tool's
    /// current image and queues it.
    pub async fn request_run(&self, owner: OwnerId, tool_id: ToolId) -> Result<CommandReceipt> {
        let tool = self.owned_tool(owner, tool_id).await?;
        let build = match tool.current_image_ref.as_deref() {
            Some(image_ref) => self.store.latest_build_with_image(tool.id, image_ref).await?,
            None => None,
        };
        let new_run = begin_run(&tool, build.as_ref())?;
        let run = self
            .store
            .commit(Transition::new().with_run(RunChange::Create(new_run)))
            .await?
            .runs
            .into_iter()
            .next()
            .ok_or_else(|| missing("run", tool_id))?;

        match self.dispatcher.enqueue(Job::Run { tool_id, run_id: run.id }).await {
            Ok(job_id) => {
                info!(%tool_id, run_id = %run.id, build_id = %run.build_id, %job_id, "run queued");
                let mut receipt = CommandReceipt::new(Acceptance::Starting, Some(job_id));
                receipt.run_id = Some(run.id);
                Ok(receipt)
            }
            Err(e) => {
                let outcome = RunOutcome::Failure {
                    logs: vec![format!("dispatch failed: {}", e)],
                };
                let settled = complete_run(&tool, &run, &outcome, self.config.max_log_bytes);
                if let Ok((_, failed)) = settled {
                    if let Err(commit_err) = self
                        .store
                        .commit(Transition::new().with_run(RunChange::Update(failed)))
                        .await
                    {
                        error!(%tool_id, run_id = %run.id, "failed to settle undispatched run: {}", commit_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// `RequestStop`: queues a stop for a Running tool; anything else is
    /// accepted and ignored.
    pub async fn request_stop(&self, owner: OwnerId, tool_id: ToolId) -> Result<CommandReceipt> {
        let tool = self.owned_tool(owner, tool_id).await?;
        match begin_stop(&tool) {
            StopDecision::Ignore => Ok(CommandReceipt::new(Acceptance::Ignored, None)),
            StopDecision::Dispatch => {
                let job_id = self.dispatcher.enqueue(Job::Stop { tool_id }).await?;
                info!(%tool_id, %job_id, "stop queued");
                Ok(CommandReceipt::new(Acceptance::Stopping, Some(job_id)))
            }
        }
    }

    // =========================================================================
    // Job handlers
    // =========================================================================

    async fn handle_build(&self, tool_id: ToolId, build_id: BuildId) -> Result<()> {
        let Some(build) = self.store.build(build_id).await? else {
            warn!(%tool_id, %build_id, "build vanished before execution");
            return Ok(());
        };

        let build = match build.status {
            BuildStatus::Success | BuildStatus::Failed => {
                debug!(%tool_id, %build_id, status = %build.status, "build already settled");
                return Ok(());
            }
            BuildStatus::Running => {
                info!(%tool_id, %build_id, "re-executing interrupted build");
                build
            }
            BuildStatus::Pending => {
                let running = start_build(&build)?;
                match self
                    .store
                    .commit(Transition::new().with_build(BuildChange::Update(running)))
                    .await
                {
                    Ok(committed) => committed.build.ok_or_else(|| missing("build", build_id))?,
                    Err(e) if e.is_conflict() => {
                        debug!(%tool_id, %build_id, "build claimed by another delivery");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let outcome = match self.store.version(build.version_id).await? {
            Some(version) => {
                self.client
                    .build(tool_id, version.id, &version.source, &version.manifest)
                    .await
            }
            None => BuildOutcome::Failure {
                logs: vec![format!("version {} not found", build.version_id)],
            },
        };
        self.settle_build(tool_id, build_id, &outcome).await
    }

    async fn settle_build(&self, tool_id: ToolId, build_id: BuildId, outcome: &BuildOutcome) -> Result<()> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let (Some(tool), Some(build)) = (self.store.tool(tool_id).await?, self.store.build(build_id).await?)
            else {
                warn!(%tool_id, %build_id, "tool deleted while building");
                return Ok(());
            };
            if build.status != BuildStatus::Running {
                debug!(%tool_id, %build_id, status = %build.status, "build settled elsewhere");
                return Ok(());
            }

            let (next_tool, next_build) =
                complete_build(&tool, &build, outcome, self.config.max_log_bytes)?;
            let transition = Transition::new()
                .with_tool(next_tool)
                .with_build(BuildChange::Update(next_build));
            match self.store.commit(transition).await {
                Ok(committed) => {
                    let status = committed.build.map(|b| b.status);
                    info!(%tool_id, %build_id, ?status, "build completed");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(%tool_id, %build_id, attempt, "build completion raced, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict {
            entity: "tool",
            id: tool_id.to_string(),
        })
    }

    async fn handle_run(&self, tool_id: ToolId, run_id: RunId) -> Result<()> {
        let Some(run) = self.store.run(run_id).await? else {
            warn!(%tool_id, %run_id, "run vanished before execution");
            return Ok(());
        };
        if run.status != RunStatus::Starting {
            debug!(%tool_id, %run_id, status = %run.status, "run already settled");
            return Ok(());
        }

        let image_ref = self
            .store
            .build(run.build_id)
            .await?
            .and_then(|build| build.image_ref);
        let outcome = match image_ref {
            Some(image_ref) => self.client.run(tool_id, &image_ref).await,
            None => RunOutcome::Failure {
                logs: vec!["Build not found".to_string()],
            },
        };

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let (Some(tool), Some(run)) = (self.store.tool(tool_id).await?, self.store.run(run_id).await?)
            else {
                warn!(%tool_id, %run_id, "tool deleted while starting");
                if matches!(outcome, RunOutcome::Success { .. }) {
                    if let Err(e) = self.client.remove(tool_id).await {
                        error!(%tool_id, "failed to remove container of deleted tool: {}", e);
                    }
                }
                return Ok(());
            };
            if run.status != RunStatus::Starting {
                debug!(%tool_id, %run_id, status = %run.status, "run settled elsewhere");
                return Ok(());
            }

            let (next_tool, next_run) = complete_run(&tool, &run, &outcome, self.config.max_log_bytes)?;
            let mut transition = Transition::new()
                .with_tool(next_tool)
                .with_run(RunChange::Update(next_run));
            if matches!(outcome, RunOutcome::Success { .. }) {
                let replaced = supersede_runs(
                    &self.store.runs_for_tool(tool_id).await?,
                    run_id,
                    self.config.max_log_bytes,
                );
                transition = transition.with_runs(replaced.into_iter().map(RunChange::Update));
            }
            match self.store.commit(transition).await {
                Ok(committed) => {
                    let status = committed.run().map(|r| r.status);
                    let replaced = committed.runs.len().saturating_sub(1);
                    info!(%tool_id, %run_id, ?status, replaced, "run completed");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(%tool_id, %run_id, attempt, "run completion raced, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict {
            entity: "tool",
            id: tool_id.to_string(),
        })
    }

    async fn handle_stop(&self, tool_id: ToolId) -> Result<()> {
        match self.store.tool(tool_id).await? {
            Some(tool) if begin_stop(&tool) == StopDecision::Dispatch => {}
            _ => {
                debug!(%tool_id, "tool not running, stop is a no-op");
                return Ok(());
            }
        }

        if let Err(e) = self.client.stop(tool_id).await {
            if e.is_not_found() {
                warn!(%tool_id, "stop found no container: {}", e);
            } else {
                error!(%tool_id, "stop failed: {}", e);
            }
            return self.record_stop_failure(tool_id, &e).await;
        }

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let Some(tool) = self.store.tool(tool_id).await? else {
                return Ok(());
            };
            let latest_run = self.store.latest_run(tool_id).await?;
            let Some((next_tool, next_run)) = complete_stop(
                &tool,
                latest_run.as_ref(),
                RUN_STOPPED_LOG,
                self.config.max_log_bytes,
            ) else {
                debug!(%tool_id, "tool left Running during stop");
                return Ok(());
            };

            let mut transition = Transition::new().with_tool(next_tool);
            if let Some(run) = next_run {
                transition = transition.with_run(RunChange::Update(run));
            }
            match self.store.commit(transition).await {
                Ok(_) => {
                    info!(%tool_id, "tool stopped");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(%tool_id, attempt, "stop completion raced, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict {
            entity: "tool",
            id: tool_id.to_string(),
        })
    }

    /// Appends a failed stop's error to the tool's latest run. Tool and run
    /// statuses are left as they are.
    async fn record_stop_failure(&self, tool_id: ToolId, cause: &Error) -> Result<()> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let Some(mut next) = self.store.latest_run(tool_id).await? else {
                return Ok(());
            };
            next.append_log(&cause.to_string(), self.config.max_log_bytes);
            match self
                .store
                .commit(Transition::new().with_run(RunChange::Update(next)))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(%tool_id, attempt, "stop failure record raced, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict {
            entity: "run",
            id: tool_id.to_string(),
        })
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &Job) -> Result<()> {
        match *job {
            Job::Build { tool_id, build_id } => self.handle_build(tool_id, build_id).await,
            Job::Run { tool_id, run_id } => self.handle_run(tool_id, run_id).await,
            Job::Stop { tool_id } => self.handle_stop(tool_id).await,
        }
    }
}
