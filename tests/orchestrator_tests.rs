//! Tests for the tool lifecycle orchestrator.
//!
//! Drives commands and job handling end to end against an in-memory store
//! and the scripted runtime from `common`.

mod common;

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{FakeDriver, Harness, OWNER, STRANGER};
use sheetify::{
    Acceptance, BuildStatus, ContainerDriver, ContainerName, ContainerSpec, Error, ImageBuild,
    Job, JobHandler, MemoryStore, Orchestrator, OrchestratorConfig, QueueDispatcher, Result,
    RunStatus, Store, ToolId, ToolStatus, VersionId,
};

// =============================================================================
// Full Lifecycle
// =============================================================================

#[tokio::test]
async fn test_build_run_stop_scenario() {
    let mut h = Harness::new();
    let (tool, version) = h.tool_with_source("import pandas\n").await;
    assert_eq!(version.manifest, "streamlit>=1.32\npandas");

    // Build
    let receipt = h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    assert_eq!(receipt.status, Acceptance::Queued);
    let build_id = receipt.build_id.unwrap();
    assert_eq!(
        h.orchestrator.get_tool(OWNER, tool.id).await.unwrap().status,
        ToolStatus::Building
    );
    assert_eq!(h.store.build(build_id).await.unwrap().unwrap().status, BuildStatus::Pending);

    assert_eq!(h.drain().await, 1);
    let expected_image = format!("sheetify-tool-{}:v{}", tool.id, version.id);
    let built = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(built.status, ToolStatus::Idle);
    assert_eq!(built.current_image_ref.as_deref(), Some(expected_image.as_str()));
    assert_eq!(built.current_version_id, Some(version.id));

    let build = h.store.build(build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Success);
    assert_eq!(build.image_ref.as_deref(), Some(expected_image.as_str()));
    assert!(build.logs.contains("Successfully tagged"));

    // Run
    let receipt = h.orchestrator.request_run(OWNER, tool.id).await.unwrap();
    assert_eq!(receipt.status, Acceptance::Starting);
    let run_id = receipt.run_id.unwrap();
    assert_eq!(h.store.run(run_id).await.unwrap().unwrap().status, RunStatus::Starting);

    h.drain().await;
    let running = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(running.status, ToolStatus::Running);
    let run = h.store.run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.url, Some(format!("/t/{}", tool.id)));
    assert_eq!(run.logs, "Container started");
    assert!(run.container_ref.is_some());
    assert!(h.driver.container(&format!("sheetify-tool-{}", tool.id)).is_some());

    // Stop
    let receipt = h.orchestrator.request_stop(OWNER, tool.id).await.unwrap();
    assert_eq!(receipt.status, Acceptance::Stopping);
    assert_eq!(
        h.orchestrator.get_tool(OWNER, tool.id).await.unwrap().status,
        ToolStatus::Running,
        "state changes only when the stop completes"
    );

    h.drain().await;
    let stopped = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(stopped.status, ToolStatus::Idle);
    assert_eq!(stopped.current_image_ref, built.current_image_ref);
    let run = h.store.run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Stopped);
    assert_eq!(run.logs, "Container started\nStopped by user");
    assert_eq!(h.driver.container_count(), 0);
}

#[tokio::test]
async fn test_image_descriptor_uses_configured_base() {
    let mut h = Harness::with_config(OrchestratorConfig {
        base_image: "registry.local/sheetify-base:3.11".to_string(),
        ..Default::default()
    });
    h.built_tool().await;

    let state = h.driver.state();
    assert_eq!(state.dockerfiles.len(), 1);
    assert!(state.dockerfiles[0].starts_with("FROM registry.local/sheetify-base:3.11\n"));
}

// =============================================================================
// Upload Validation
// =============================================================================

#[tokio::test]
async fn test_dangerous_upload_creates_nothing() {
    let h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;

    let err = h
        .orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import subprocess\n", None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(err.to_string(), "Dangerous import detected: subprocess");
    assert_eq!(h.store.versions_for_tool(tool.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_records_digest_and_metadata() {
    let h = Harness::new();
    let (tool, first) = h.tool_with_source("import numpy\n").await;
    let metadata = serde_json::json!({"title": "Explorer", "tags": ["csv"]});
    let second = h
        .orchestrator
        .upload_version(OWNER, tool.id, "tool.py", b"import numpy\n", Some(metadata.clone()))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.digest, second.digest, "same bytes, same digest");
    assert_eq!(second.metadata, Some(metadata));
}

#[tokio::test]
async fn test_upload_respects_configured_limit() {
    let h = Harness::with_config(OrchestratorConfig {
        max_upload_bytes: 8,
        ..Default::default()
    });
    let tool = h.orchestrator.create_tool(OWNER, "tiny", None).await.unwrap();
    let err = h
        .orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import pandas\n", None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

// =============================================================================
// Preconditions
// =============================================================================

#[tokio::test]
async fn test_run_before_build_is_rejected() {
    let mut h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;

    let err = h.orchestrator.request_run(OWNER, tool.id).await.unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(err.to_string(), "No built image");
    assert!(h.store.runs_for_tool(tool.id).await.unwrap().is_empty());
    assert_eq!(h.drain().await, 0);
    assert!(h.driver.calls().is_empty());
}

#[tokio::test]
async fn test_build_without_upload() {
    let h = Harness::new();
    let tool = h.orchestrator.create_tool(OWNER, "empty", None).await.unwrap();
    let err = h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap_err();
    assert_eq!(err.to_string(), "No version specified");
}

#[tokio::test]
async fn test_build_of_foreign_version_is_rejected() {
    let h = Harness::new();
    let (first, _) = h.tool_with_source("import pandas\n").await;
    let (_, other_version) = h.tool_with_source("import numpy\n").await;

    let err = h
        .orchestrator
        .request_build(OWNER, first.id, Some(other_version.id))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid version");

    let err = h
        .orchestrator
        .request_build(OWNER, first.id, Some(VersionId(9_999)))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid version");
}

#[tokio::test]
async fn test_concurrent_build_is_rejected() {
    let h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;

    h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    let err = h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap_err();
    assert_eq!(err.to_string(), "Build already in progress");

    let versions = h.store.versions_for_tool(tool.id).await.unwrap();
    let builds = h.store.builds_for_version(versions[0].id).await.unwrap();
    assert_eq!(builds.len(), 1);
}

#[tokio::test]
async fn test_build_defaults_to_latest_upload() {
    let mut h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;
    let latest = h
        .orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import numpy\n", None)
        .await
        .unwrap();

    h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    h.drain().await;

    let tool = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(tool.current_version_id, Some(latest.id));
}

#[tokio::test]
async fn test_foreign_owner_sees_not_found() {
    let h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;

    for err in [
        h.orchestrator.get_tool(STRANGER, tool.id).await.unwrap_err(),
        h.orchestrator.request_build(STRANGER, tool.id, None).await.unwrap_err(),
        h.orchestrator.request_stop(STRANGER, tool.id).await.unwrap_err(),
        h.orchestrator.delete_tool(STRANGER, tool.id).await.unwrap_err(),
    ] {
        assert!(matches!(err, Error::ToolNotFound));
        assert_eq!(err.to_string(), "Tool not found");
    }
}

// =============================================================================
// Orchestration Failures
// =============================================================================

#[tokio::test]
async fn test_build_failure_sets_error() {
    let mut h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandass\n").await;
    h.driver.state().fail_build = true;

    let receipt = h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    h.drain().await;

    let tool = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(tool.status, ToolStatus::Error);
    assert!(tool.current_image_ref.is_none());

    let build = h.store.build(receipt.build_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.image_ref.is_none());
    assert!(build.logs.contains("No matching distribution found for pandass"));
    assert!(build.logs.contains("build exited"));
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_image() {
    let mut h = Harness::new();
    let tool = h.built_tool().await;
    let previous = tool.current_image_ref.clone();

    h.orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import pandass\n", None)
        .await
        .unwrap();
    h.driver.state().fail_build = true;
    h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    h.drain().await;

    let tool = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(tool.status, ToolStatus::Error);
    assert_eq!(tool.current_image_ref, previous);

    // The previous image can still be run.
    h.orchestrator.request_run(OWNER, tool.id).await.unwrap();
    h.drain().await;
    assert_eq!(
        h.orchestrator.get_tool(OWNER, tool.id).await.unwrap().status,
        ToolStatus::Running
    );
}

#[tokio::test]
async fn test_runtime_down_during_build() {
    let mut h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;
    h.driver.state().runtime_down = true;

    let receipt = h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    assert_eq!(h.drain().await, 1);

    let build = h.store.build(receipt.build_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.logs.contains("not available"));
    assert_eq!(
        h.orchestrator.get_tool(OWNER, tool.id).await.unwrap().status,
        ToolStatus::Error
    );
}

#[tokio::test]
async fn test_run_failure_sets_error() {
    let mut h = Harness::new();
    let tool = h.built_tool().await;
    h.driver.state().fail_run = true;

    let receipt = h.orchestrator.request_run(OWNER, tool.id).await.unwrap();
    h.drain().await;

    let run = h.store.run(receipt.run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.logs.contains("port is already allocated"));
    assert!(run.url.is_none());
    assert_eq!(
        h.orchestrator.get_tool(OWNER, tool.id).await.unwrap().status,
        ToolStatus::Error
    );
}

// =============================================================================
// Container Identity
// =============================================================================

#[tokio::test]
async fn test_run_twice_leaves_one_container() {
    let mut h = Harness::new();
    let tool = h.running_tool().await;
    let name = format!("sheetify-tool-{}", tool.id);
    let first = h.driver.container(&name).unwrap();

    h.orchestrator.request_run(OWNER, tool.id).await.unwrap();
    h.drain().await;

    assert_eq!(h.driver.container_count(), 1);
    let second = h.driver.container(&name).unwrap();
    assert_ne!(first.id, second.id, "old container replaced, not reused");
    assert!(h.driver.calls().contains(&format!("rm -f {}", name)));

    let runs = h.store.runs_for_tool(tool.id).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Stopped);
    assert!(runs[0].logs.ends_with(&format!("Replaced by run {}", runs[1].id)));
    assert_eq!(runs[1].status, RunStatus::Running);
    assert_eq!(runs.iter().filter(|r| r.status.is_active()).count(), 1);

    h.orchestrator.request_stop(OWNER, tool.id).await.unwrap();
    h.drain().await;
    let runs = h.store.runs_for_tool(tool.id).await.unwrap();
    assert!(runs.iter().all(|r| !r.status.is_active()));
    assert_eq!(h.driver.container_count(), 0);
}

#[tokio::test]
async fn test_container_carries_routing_and_posture() {
    let mut h = Harness::new();
    let tool = h.running_tool().await;
    let container = h.driver.container(&format!("sheetify-tool-{}", tool.id)).unwrap();

    let router = format!("traefik.http.routers.tool{}", tool.id);
    assert_eq!(container.spec.network.as_deref(), Some("web"));
    assert_eq!(
        container.spec.labels[&format!("{}.rule", router)],
        format!("PathPrefix(`/t/{}`)", tool.id)
    );
    assert_eq!(container.spec.security_opts, vec!["no-new-privileges"]);
    assert_eq!(container.spec.cap_drop, vec!["NET_RAW"]);
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn test_stop_idle_tool_is_ignored() {
    let mut h = Harness::new();
    let tool = h.built_tool().await;
    let calls_before = h.driver.calls().len();

    let receipt = h.orchestrator.request_stop(OWNER, tool.id).await.unwrap();
    assert_eq!(receipt.status, Acceptance::Ignored);
    assert!(receipt.job_id.is_none());
    assert_eq!(h.drain().await, 0);
    assert_eq!(h.driver.calls().len(), calls_before);

    let after = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(after.status, ToolStatus::Idle);
    assert_eq!(after.revision, tool.revision);
}

#[tokio::test]
async fn test_stop_with_missing_container_keeps_state() {
    let mut h = Harness::new();
    let tool = h.running_tool().await;
    h.driver.state().containers.clear();

    h.orchestrator.request_stop(OWNER, tool.id).await.unwrap();
    assert_eq!(h.drain().await, 1);

    let after = h.orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(after.status, ToolStatus::Running);
    let run = h.store.latest_run(tool.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run
        .logs
        .ends_with(&format!("Container not running: sheetify-tool-{}", tool.id)));
}

#[tokio::test]
async fn test_stop_failure_keeps_state() {
    let mut h = Harness::new();
    let tool = h.running_tool().await;
    h.driver.state().fail_stop = true;

    h.orchestrator.request_stop(OWNER, tool.id).await.unwrap();
    h.drain().await;

    assert_eq!(
        h.orchestrator.get_tool(OWNER, tool.id).await.unwrap().status,
        ToolStatus::Running
    );
    assert_eq!(h.driver.container_count(), 1);

    let run = h.store.latest_run(tool.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    let last = run.logs.lines().last().unwrap();
    assert!(last.contains(&format!("sheetify-tool-{}", tool.id)));
    assert!(last.contains("did not receive an exit event"));
}

// =============================================================================
// Re-delivery
// =============================================================================

#[tokio::test]
async fn test_redelivered_jobs_are_noops() {
    let mut h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;
    let build_id = h
        .orchestrator
        .request_build(OWNER, tool.id, None)
        .await
        .unwrap()
        .build_id
        .unwrap();
    h.drain().await;

    let job = Job::Build {
        tool_id: tool.id,
        build_id,
    };
    h.orchestrator.handle(&job).await.unwrap();
    assert_eq!(h.driver.count("build"), 1);

    let run_id = h.orchestrator.request_run(OWNER, tool.id).await.unwrap().run_id.unwrap();
    h.drain().await;
    let job = Job::Run {
        tool_id: tool.id,
        run_id,
    };
    h.orchestrator.handle(&job).await.unwrap();
    assert_eq!(h.driver.count("run"), 1);

    h.orchestrator.request_stop(OWNER, tool.id).await.unwrap();
    h.drain().await;
    let stops = h.driver.count("stop");
    h.orchestrator.handle(&Job::Stop { tool_id: tool.id }).await.unwrap();
    assert_eq!(h.driver.count("stop"), stops);

    let run = h.store.run(run_id).await.unwrap().unwrap();
    assert_eq!(run.logs.matches("Stopped by user").count(), 1);
}

#[tokio::test]
async fn test_jobs_for_deleted_tool_are_dropped() {
    let mut h = Harness::new();
    let (tool, _) = h.tool_with_source("import pandas\n").await;
    h.orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    h.orchestrator.delete_tool(OWNER, tool.id).await.unwrap();

    assert_eq!(h.drain().await, 1);
    assert_eq!(h.driver.count("build"), 0);
}

// =============================================================================
// Concurrent Deletion
// =============================================================================

/// Deletes the tool's records right after its container starts, the way a
/// concurrent delete landing mid-start would.
struct DeleteOnRun {
    inner: Arc<FakeDriver>,
    store: Arc<MemoryStore>,
    tool: OnceLock<ToolId>,
}

#[async_trait]
impl ContainerDriver for DeleteOnRun {
    fn name(&self) -> &str {
        "delete-on-run"
    }

    async fn check_available(&self) -> Result<()> {
        self.inner.check_available().await
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<ImageBuild> {
        self.inner.build_image(context, tag).await
    }

    async fn container_exists(&self, name: &ContainerName) -> Result<bool> {
        self.inner.container_exists(name).await
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.inner.run_container(spec).await?;
        if let Some(tool) = self.tool.get() {
            self.store.delete_tool(*tool).await?;
        }
        Ok(id)
    }

    async fn stop_container(&self, name: &ContainerName) -> Result<()> {
        self.inner.stop_container(name).await
    }

    async fn remove_container(&self, name: &ContainerName, force: bool) -> Result<()> {
        self.inner.remove_container(name, force).await
    }
}

#[tokio::test]
async fn test_tool_deleted_mid_start_leaves_no_container() {
    let config = Arc::new(OrchestratorConfig::default());
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeDriver::new());
    let driver = Arc::new(DeleteOnRun {
        inner: fake.clone(),
        store: store.clone(),
        tool: OnceLock::new(),
    });
    let (dispatcher, queue) = QueueDispatcher::new();
    let mut queue = queue.with_backoff(Duration::ZERO);
    let orchestrator = Orchestrator::new(
        config.clone(),
        store.clone(),
        driver.clone(),
        Arc::new(dispatcher),
    );

    let tool = orchestrator.create_tool(OWNER, "explorer", None).await.unwrap();
    orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import pandas\n", None)
        .await
        .unwrap();
    orchestrator.request_build(OWNER, tool.id, None).await.unwrap();
    queue.run_pending(&orchestrator, config.max_job_attempts).await;

    driver.tool.set(tool.id).unwrap();
    orchestrator.request_run(OWNER, tool.id).await.unwrap();
    queue.run_pending(&orchestrator, config.max_job_attempts).await;

    assert!(store.tool(tool.id).await.unwrap().is_none());
    assert_eq!(fake.container_count(), 0);
    assert!(fake
        .calls()
        .contains(&format!("rm -f sheetify-tool-{}", tool.id)));
}

// =============================================================================
// Dispatch Failures
// =============================================================================

#[tokio::test]
async fn test_closed_dispatcher_fails_the_build() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, queue) = QueueDispatcher::new();
    drop(queue);
    let orchestrator = Orchestrator::new(
        Arc::new(OrchestratorConfig::default()),
        store.clone(),
        Arc::new(FakeDriver::new()),
        Arc::new(dispatcher),
    );

    let tool = orchestrator.create_tool(OWNER, "explorer", None).await.unwrap();
    let version = orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import pandas\n", None)
        .await
        .unwrap();

    let err = orchestrator.request_build(OWNER, tool.id, None).await.unwrap_err();
    assert!(matches!(err, Error::DispatcherClosed(_)));

    let tool = orchestrator.get_tool(OWNER, tool.id).await.unwrap();
    assert_eq!(tool.status, ToolStatus::Error, "tool must not stay Building");
    let builds = store.builds_for_version(version.id).await.unwrap();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].status, BuildStatus::Failed);
    assert!(builds[0].logs.contains("dispatch failed"));
}

// =============================================================================
// Tool Management
// =============================================================================

#[tokio::test]
async fn test_create_tool_requires_name() {
    let h = Harness::new();
    let err = h.orchestrator.create_tool(OWNER, "   ", None).await.unwrap_err();
    assert!(err.is_precondition());
}

#[tokio::test]
async fn test_tool_detail_lists_history() {
    let mut h = Harness::new();
    let tool = h.running_tool().await;
    h.orchestrator
        .upload_version(OWNER, tool.id, "app.py", b"import numpy\n", None)
        .await
        .unwrap();

    let detail = h.orchestrator.tool_detail(OWNER, tool.id).await.unwrap();
    assert_eq!(detail.tool.id, tool.id);
    assert_eq!(detail.versions.len(), 2);
    assert!(detail.versions[0].version.id < detail.versions[1].version.id);
    assert_eq!(detail.versions[0].builds.len(), 1);
    assert!(detail.versions[1].builds.is_empty());
    assert_eq!(detail.runs.len(), 1);

    let json = serde_json::to_value(&detail).unwrap();
    assert_eq!(json["status"], "running");
    assert_eq!(json["versions"][0]["builds"][0]["status"], "success");
}

#[tokio::test]
async fn test_delete_tool_removes_container_and_records() {
    let mut h = Harness::new();
    let tool = h.running_tool().await;
    assert_eq!(h.driver.container_count(), 1);

    h.orchestrator.delete_tool(OWNER, tool.id).await.unwrap();

    assert_eq!(h.driver.container_count(), 0);
    assert!(h.store.tool(tool.id).await.unwrap().is_none());
    assert!(h.store.runs_for_tool(tool.id).await.unwrap().is_empty());
    assert!(h.store.versions_for_tool(tool.id).await.unwrap().is_empty());
}
