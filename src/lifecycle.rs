//! # Lifecycle State Machine
//!
//! Pure transition functions over Tool/Build/Run records. Nothing here does
//! I/O: each function takes the records as read from the store and returns
//! the records to write (or a rejection). The orchestrator commits the result
//! atomically through [`crate::store::Store::commit`].
//!
//! ```text
//!                 RequestBuild                BuildCompleted(ok)
//!   Idle/Error/Running ───────▶ Building ──────────────────────▶ Idle
//!                                  │
//!                                  └── BuildCompleted(err) ────▶ Error
//!
//!                 RunCompleted(ok)             StopCompleted
//!   any ─────────────────────────▶ Running ───────────────────▶ Idle
//!   any ── RunCompleted(err) ────▶ Error
//! ```
//!
//! Commands (`begin_*`) run on the control plane and only check
//! preconditions. Completions (`start_build`, `complete_*`) run in the worker
//! that made the runtime call.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::RUN_REPLACED_LOG;
use crate::error::{Error, Result};
use crate::model::{
    Build, BuildStatus, NewBuild, NewRun, OwnerId, Run, RunId, RunStatus, Tool, ToolStatus,
    Version,
};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of an image build as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum BuildOutcome {
    Success { image_ref: String, logs: Vec<String> },
    Failure { logs: Vec<String> },
}

/// Result of a container start as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RunOutcome {
    Success {
        container_ref: String,
        url: String,
        logs: Vec<String>,
    },
    Failure {
        logs: Vec<String>,
    },
}

/// What a stop request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// Tool is Running: hand a stop job to the dispatcher.
    Dispatch,
    /// Tool is not Running: accept and do nothing.
    Ignore,
}

// =============================================================================
// Commands
// =============================================================================

/// Returns the tool if `caller` owns it; foreign and missing tools look the same.
pub fn authorize(tool: Option<Tool>, caller: OwnerId) -> Result<Tool> {
    match tool {
        Some(tool) if tool.is_owned_by(caller) => Ok(tool),
        _ => Err(Error::ToolNotFound),
    }
}

/// `RequestBuild`: checks the resolved version and marks the tool Building.
///
/// A second build request while one is pending or running is rejected, so
/// builds of one tool are mutually exclusive.
pub fn begin_build(tool: &Tool, version: Option<&Version>) -> Result<(Tool, NewBuild)> {
    let version = version.ok_or_else(|| Error::precondition("No version specified"))?;
    if version.tool_id != tool.id {
        return Err(Error::precondition("Invalid version"));
    }
    if tool.status == ToolStatus::Building {
        return Err(Error::precondition("Build already in progress"));
    }

    let mut next = tool.clone();
    next.status = ToolStatus::Building;
    debug!(tool_id = %tool.id, version_id = %version.id, "build accepted");
    Ok((
        next,
        NewBuild {
            tool_id: tool.id,
            version_id: version.id,
        },
    ))
}

/// `RequestRun`: requires a current image and the build that produced it.
pub fn begin_run(tool: &Tool, build: Option<&Build>) -> Result<NewRun> {
    let image_ref = tool
        .current_image_ref
        .as_deref()
        .ok_or_else(|| Error::precondition("No built image"))?;
    let build = build.ok_or_else(|| Error::precondition("Build not found"))?;
    if build.tool_id != tool.id || build.image_ref.as_deref() != Some(image_ref) {
        return Err(Error::precondition("Build not found"));
    }

    debug!(tool_id = %tool.id, build_id = %build.id, "run accepted");
    Ok(NewRun {
        tool_id: tool.id,
        build_id: build.id,
    })
}

/// `RequestStop`: only a Running tool has anything to stop.
pub fn begin_stop(tool: &Tool) -> StopDecision {
    if tool.status == ToolStatus::Running {
        StopDecision::Dispatch
    } else {
        debug!(tool_id = %tool.id, status = %tool.status, "stop ignored");
        StopDecision::Ignore
    }
}

// =============================================================================
// Completions
// =============================================================================

fn check_build(build: &Build, next: BuildStatus) -> Result<()> {
    if build.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            entity: "build",
            from: build.status.to_string(),
            to: next.to_string(),
        })
    }
}

fn check_run(run: &Run, next: RunStatus) -> Result<()> {
    if run.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            entity: "run",
            from: run.status.to_string(),
            to: next.to_string(),
        })
    }
}

/// Pending → Running, just before the runtime call.
pub fn start_build(build: &Build) -> Result<Build> {
    check_build(build, BuildStatus::Running)?;
    let mut next = build.clone();
    next.status = BuildStatus::Running;
    Ok(next)
}

/// `BuildCompleted`: settles the build and, on success, repoints the tool.
///
/// Tool status, image reference and version reference are returned together
/// with the build record so they are committed as one write.
pub fn complete_build(
    tool: &Tool,
    build: &Build,
    outcome: &BuildOutcome,
    max_log_bytes: usize,
) -> Result<(Tool, Build)> {
    let mut next_tool = tool.clone();
    let mut next_build = build.clone();

    match outcome {
        BuildOutcome::Success { image_ref, logs } => {
            if image_ref.trim().is_empty() {
                return Err(Error::InvalidTransition {
                    entity: "build",
                    from: build.status.to_string(),
                    to: "success without image reference".to_string(),
                });
            }
            check_build(build, BuildStatus::Success)?;
            next_build.status = BuildStatus::Success;
            next_build.image_ref = Some(image_ref.clone());
            next_build.append_logs(logs, max_log_bytes);

            next_tool.status = ToolStatus::Idle;
            next_tool.current_image_ref = Some(image_ref.clone());
            next_tool.current_version_id = Some(build.version_id);
        }
        BuildOutcome::Failure { logs } => {
            check_build(build, BuildStatus::Failed)?;
            next_build.status = BuildStatus::Failed;
            next_build.append_logs(logs, max_log_bytes);
            next_tool.status = ToolStatus::Error;
        }
    }
    Ok((next_tool, next_build))
}

/// `RunCompleted`: settles the run and sets the tool Running or Error.
pub fn complete_run(
    tool: &Tool,
    run: &Run,
    outcome: &RunOutcome,
    max_log_bytes: usize,
) -> Result<(Tool, Run)> {
    let mut next_tool = tool.clone();
    let mut next_run = run.clone();

    match outcome {
        RunOutcome::Success {
            container_ref,
            url,
            logs,
        } => {
            check_run(run, RunStatus::Running)?;
            next_run.status = RunStatus::Running;
            next_run.container_ref = Some(container_ref.clone());
            next_run.url = Some(url.clone());
            for line in logs {
                next_run.append_log(line, max_log_bytes);
            }
            next_tool.status = ToolStatus::Running;
        }
        RunOutcome::Failure { logs } => {
            check_run(run, RunStatus::Failed)?;
            next_run.status = RunStatus::Failed;
            for line in logs {
                next_run.append_log(line, max_log_bytes);
            }
            next_tool.status = ToolStatus::Error;
        }
    }
    Ok((next_tool, next_run))
}

/// Settles every other active run of a tool once `current` owns the tool's
/// container. Each is marked Stopped with a line naming its replacement.
pub fn supersede_runs(runs: &[Run], current: RunId, max_log_bytes: usize) -> Vec<Run> {
    runs.iter()
        .filter(|run| run.id != current && run.status.can_transition_to(RunStatus::Stopped))
        .map(|run| {
            let mut next = run.clone();
            next.status = RunStatus::Stopped;
            next.append_log(&format!("{} {}", RUN_REPLACED_LOG, current), max_log_bytes);
            next
        })
        .collect()
}

/// `StopCompleted`: tool back to Idle, latest run Stopped with `log_line`.
///
/// Returns `None` when the tool is no longer Running (the stop is moot). A
/// latest run that already settled elsewhere is left untouched.
pub fn complete_stop(
    tool: &Tool,
    latest_run: Option<&Run>,
    log_line: &str,
    max_log_bytes: usize,
) -> Option<(Tool, Option<Run>)> {
    if tool.status != ToolStatus::Running {
        return None;
    }
    let mut next_tool = tool.clone();
    next_tool.status = ToolStatus::Idle;

    let next_run = latest_run
        .filter(|run| run.status.can_transition_to(RunStatus::Stopped))
        .map(|run| {
            let mut next = run.clone();
            next.status = RunStatus::Stopped;
            next.append_log(log_line, max_log_bytes);
            next
        });
    Some((next_tool, next_run))
}
