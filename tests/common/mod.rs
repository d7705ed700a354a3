//! Shared fixtures for integration tests.
//!
//! [`FakeDriver`] models a container runtime in memory: images are tags in a
//! set, containers live in a name-keyed map, and every call is recorded. It
//! rejects what a real runtime rejects (duplicate names, unknown images,
//! removing a running container without force), so replace semantics are
//! actually exercised.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sheetify::{
    ContainerDriver, ContainerName, ContainerSpec, Error, ImageBuild, JobQueue, MemoryStore,
    Orchestrator, OrchestratorConfig, OwnerId, QueueDispatcher, Result, Tool, Version,
};

pub const OWNER: OwnerId = OwnerId(7);
pub const STRANGER: OwnerId = OwnerId(8);

// =============================================================================
// Fake container runtime
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub images: BTreeSet<String>,
    pub containers: BTreeMap<String, FakeContainer>,
    pub calls: Vec<String>,
    /// Dockerfile contents seen by each build, in order.
    pub dockerfiles: Vec<String>,
    pub fail_build: bool,
    pub fail_run: bool,
    pub fail_stop: bool,
    pub runtime_down: bool,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of recorded calls starting with `verb`.
    pub fn count(&self, verb: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state().containers.get(name).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    fn down(&self, state: &FakeState) -> Result<()> {
        if state.runtime_down {
            Err(Error::RuntimeUnavailable {
                runtime: "fake".to_string(),
                reason: "Cannot connect to the Docker daemon".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn check_available(&self) -> Result<()> {
        let state = self.state();
        self.down(&state)
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<ImageBuild> {
        let mut state = self.state();
        state.calls.push(format!("build {}", tag));
        self.down(&state)?;

        let dockerfile = std::fs::read_to_string(context.join("Dockerfile"))?;
        let first = dockerfile.lines().next().unwrap_or_default().to_string();
        state.dockerfiles.push(dockerfile);

        if state.fail_build {
            return Err(Error::BuildFailed {
                image: tag.to_string(),
                reason: "build exited with exit status: 1".to_string(),
                logs: vec![
                    format!("Step 1/5 : {}", first),
                    "ERROR: No matching distribution found for pandass".to_string(),
                ],
            });
        }
        state.images.insert(tag.to_string());
        Ok(ImageBuild {
            log_lines: vec![
                format!("Step 1/5 : {}", first),
                format!("Successfully tagged {}", tag),
            ],
        })
    }

    async fn container_exists(&self, name: &ContainerName) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(format!("inspect {}", name));
        self.down(&state)?;
        Ok(state.containers.contains_key(name.as_str()))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        state.calls.push(format!("run {} {}", spec.name, spec.image));
        self.down(&state)?;

        let fail = |reason: &str| Error::RunFailed {
            container: spec.name.to_string(),
            reason: reason.to_string(),
        };
        if state.fail_run {
            return Err(fail("port is already allocated"));
        }
        if state.containers.contains_key(spec.name.as_str()) {
            return Err(fail("Conflict. The container name is already in use"));
        }
        if !state.images.contains(&spec.image) {
            return Err(fail("No such image"));
        }

        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            spec.name.to_string(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: true,
            },
        );
        Ok(id)
    }

    async fn stop_container(&self, name: &ContainerName) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("stop {}", name));
        self.down(&state)?;
        if state.fail_stop {
            return Err(Error::StopFailed {
                container: name.to_string(),
                reason: "tried to kill container, but did not receive an exit event".to_string(),
            });
        }
        match state.containers.get_mut(name.as_str()) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }

    async fn remove_container(&self, name: &ContainerName, force: bool) -> Result<()> {
        let mut state = self.state();
        state
            .calls
            .push(format!("rm{} {}", if force { " -f" } else { "" }, name));
        self.down(&state)?;
        match state.containers.get(name.as_str()) {
            None => Err(Error::ContainerNotFound(name.to_string())),
            Some(container) if container.running && !force => Err(Error::StopFailed {
                container: name.to_string(),
                reason: "cannot remove a running container".to_string(),
            }),
            Some(_) => {
                state.containers.remove(name.as_str());
                Ok(())
            }
        }
    }
}

// =============================================================================
// Orchestrator harness
// =============================================================================

pub struct Harness {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<MemoryStore>,
    pub driver: Arc<FakeDriver>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: JobQueue,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(FakeDriver::new());
        let (dispatcher, queue) = QueueDispatcher::new();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            store.clone(),
            driver.clone(),
            Arc::new(dispatcher),
        ));
        Self {
            config,
            store,
            driver,
            orchestrator,
            queue: queue.with_backoff(Duration::ZERO),
        }
    }

    /// Runs every queued job to completion; returns how many ran.
    pub async fn drain(&mut self) -> usize {
        self.queue
            .run_pending(self.orchestrator.as_ref(), self.config.max_job_attempts)
            .await
    }

    /// Creates a tool owned by [`OWNER`] with one uploaded `app.py`.
    pub async fn tool_with_source(&self, source: &str) -> (Tool, Version) {
        let tool = self
            .orchestrator
            .create_tool(OWNER, "explorer", Some("CSV explorer".to_string()))
            .await
            .unwrap();
        let version = self
            .orchestrator
            .upload_version(OWNER, tool.id, "app.py", source.as_bytes(), None)
            .await
            .unwrap();
        (tool, version)
    }

    /// Creates, uploads and builds a tool; returns it in its post-build state.
    pub async fn built_tool(&mut self) -> Tool {
        let (tool, _) = self.tool_with_source("import pandas as pd\n").await;
        self.orchestrator
            .request_build(OWNER, tool.id, None)
            .await
            .unwrap();
        self.drain().await;
        self.orchestrator.get_tool(OWNER, tool.id).await.unwrap()
    }

    /// Builds and runs a tool; returns it in its post-run state.
    pub async fn running_tool(&mut self) -> Tool {
        let tool = self.built_tool().await;
        self.orchestrator.request_run(OWNER, tool.id).await.unwrap();
        self.drain().await;
        self.orchestrator.get_tool(OWNER, tool.id).await.unwrap()
    }
}
