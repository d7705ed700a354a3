//! Entity storage seam.
//!
//! Persistence is an external collaborator; this module defines the CRUD
//! surface the orchestrator needs and an in-process [`MemoryStore`].
//!
//! ## Atomic transitions
//!
//! Lifecycle transitions touch several records at once (tool status plus
//! build record plus image reference). They are written through
//! [`Store::commit`], which applies a whole [`Transition`] or nothing. Every
//! updated entity must carry the revision it was read at; if any record has
//! moved on since, the commit fails with [`Error::Conflict`] and the caller
//! re-reads and recomputes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{
    Build, BuildId, BuildStatus, NewBuild, NewRun, NewTool, NewVersion, Run, RunId, RunStatus,
    Tool, ToolId, ToolStatus, Version, VersionId,
};

/// Build record write within a [`Transition`].
#[derive(Debug, Clone)]
pub enum BuildChange {
    Create(NewBuild),
    Update(Build),
}

/// Run record write within a [`Transition`].
#[derive(Debug, Clone)]
pub enum RunChange {
    Create(NewRun),
    Update(Run),
}

/// A set of writes applied atomically by [`Store::commit`].
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub tool: Option<Tool>,
    pub build: Option<BuildChange>,
    /// Run writes, applied in order.
    pub runs: Vec<RunChange>,
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_build(mut self, change: BuildChange) -> Self {
        self.build = Some(change);
        self
    }

    pub fn with_run(mut self, change: RunChange) -> Self {
        self.runs.push(change);
        self
    }

    pub fn with_runs(mut self, changes: impl IntoIterator<Item = RunChange>) -> Self {
        self.runs.extend(changes);
        self
    }
}

/// Records as written by a successful commit (revisions bumped, ids assigned).
#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub tool: Option<Tool>,
    pub build: Option<Build>,
    /// Run records in the order their changes appeared in the transition.
    pub runs: Vec<Run>,
}

impl Committed {
    /// The first run written, which is the one a command or job targeted.
    pub fn run(&self) -> Option<&Run> {
        self.runs.first()
    }
}

/// CRUD surface over Tool/Version/Build/Run.
///
/// "Latest" queries order by insertion, which the store guarantees matches
/// creation order.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_tool(&self, tool: NewTool) -> Result<Tool>;
    async fn tool(&self, id: ToolId) -> Result<Option<Tool>>;
    /// Deletes the tool with its versions, builds and runs.
    async fn delete_tool(&self, id: ToolId) -> Result<bool>;

    async fn insert_version(&self, version: NewVersion) -> Result<Version>;
    async fn version(&self, id: VersionId) -> Result<Option<Version>>;
    async fn versions_for_tool(&self, tool_id: ToolId) -> Result<Vec<Version>>;
    async fn latest_version(&self, tool_id: ToolId) -> Result<Option<Version>>;

    async fn build(&self, id: BuildId) -> Result<Option<Build>>;
    async fn builds_for_version(&self, version_id: VersionId) -> Result<Vec<Build>>;
    /// Most recent build of `tool_id` whose image reference is `image_ref`.
    async fn latest_build_with_image(&self, tool_id: ToolId, image_ref: &str) -> Result<Option<Build>>;

    async fn run(&self, id: RunId) -> Result<Option<Run>>;
    async fn runs_for_tool(&self, tool_id: ToolId) -> Result<Vec<Run>>;
    async fn latest_run(&self, tool_id: ToolId) -> Result<Option<Run>>;

    /// Applies every write in `transition` or none of them.
    async fn commit(&self, transition: Transition) -> Result<Committed>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    tools: BTreeMap<ToolId, Tool>,
    versions: BTreeMap<VersionId, Version>,
    builds: BTreeMap<BuildId, Build>,
    runs: BTreeMap<RunId, Run>,
}

impl Tables {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store. Ids are drawn from one increasing sequence, so id
/// order is creation order across all tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(entity: &'static str, id: impl ToString) -> Error {
    Error::Conflict {
        entity,
        id: id.to_string(),
    }
}

fn missing(entity: &'static str, id: impl ToString) -> Error {
    Error::EntityNotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_tool(&self, tool: NewTool) -> Result<Tool> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let record = Tool {
            id: ToolId(tables.allocate()),
            owner: tool.owner,
            name: tool.name,
            description: tool.description,
            status: ToolStatus::Idle,
            current_image_ref: None,
            current_version_id: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        };
        tables.tools.insert(record.id, record.clone());
        Ok(record)
    }

    async fn tool(&self, id: ToolId) -> Result<Option<Tool>> {
        Ok(self.tables.read().await.tools.get(&id).cloned())
    }

    async fn delete_tool(&self, id: ToolId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.tools.remove(&id).is_none() {
            return Ok(false);
        }
        tables.versions.retain(|_, v| v.tool_id != id);
        tables.builds.retain(|_, b| b.tool_id != id);
        tables.runs.retain(|_, r| r.tool_id != id);
        debug!(tool_id = %id, "deleted tool and dependent records");
        Ok(true)
    }

    async fn insert_version(&self, version: NewVersion) -> Result<Version> {
        let mut tables = self.tables.write().await;
        if !tables.tools.contains_key(&version.tool_id) {
            return Err(missing("tool", version.tool_id));
        }
        let record = Version {
            id: VersionId(tables.allocate()),
            tool_id: version.tool_id,
            source: version.source,
            manifest: version.manifest,
            digest: version.digest,
            metadata: version.metadata,
            created_at: Utc::now(),
        };
        tables.versions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn version(&self, id: VersionId) -> Result<Option<Version>> {
        Ok(self.tables.read().await.versions.get(&id).cloned())
    }

    async fn versions_for_tool(&self, tool_id: ToolId) -> Result<Vec<Version>> {
        let tables = self.tables.read().await;
        Ok(tables
            .versions
            .values()
            .filter(|v| v.tool_id == tool_id)
            .cloned()
            .collect())
    }

    async fn latest_version(&self, tool_id: ToolId) -> Result<Option<Version>> {
        let tables = self.tables.read().await;
        Ok(tables
            .versions
            .values()
            .rev()
            .find(|v| v.tool_id == tool_id)
            .cloned())
    }

    async fn build(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.tables.read().await.builds.get(&id).cloned())
    }

    async fn builds_for_version(&self, version_id: VersionId) -> Result<Vec<Build>> {
        let tables = self.tables.read().await;
        Ok(tables
            .builds
            .values()
            .filter(|b| b.version_id == version_id)
            .cloned()
            .collect())
    }

    async fn latest_build_with_image(&self, tool_id: ToolId, image_ref: &str) -> Result<Option<Build>> {
        let tables = self.tables.read().await;
        Ok(tables
            .builds
            .values()
            .rev()
            .find(|b| b.tool_id == tool_id && b.image_ref.as_deref() == Some(image_ref))
            .cloned())
    }

    async fn run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.tables.read().await.runs.get(&id).cloned())
    }

    async fn runs_for_tool(&self, tool_id: ToolId) -> Result<Vec<Run>> {
        let tables = self.tables.read().await;
        Ok(tables
            .runs
            .values()
            .filter(|r| r.tool_id == tool_id)
            .cloned()
            .collect())
    }

    async fn latest_run(&self, tool_id: ToolId) -> Result<Option<Run>> {
        let tables = self.tables.read().await;
        Ok(tables
            .runs
            .values()
            .rev()
            .find(|r| r.tool_id == tool_id)
            .cloned())
    }

    async fn commit(&self, transition: Transition) -> Result<Committed> {
        let mut tables = self.tables.write().await;

        // Check every precondition before the first write.
        if let Some(tool) = &transition.tool {
            let stored = tables.tools.get(&tool.id).ok_or_else(|| missing("tool", tool.id))?;
            if stored.revision != tool.revision {
                return Err(conflict("tool", tool.id));
            }
        }
        match &transition.build {
            Some(BuildChange::Update(build)) => {
                let stored = tables.builds.get(&build.id).ok_or_else(|| missing("build", build.id))?;
                if stored.revision != build.revision {
                    return Err(conflict("build", build.id));
                }
            }
            Some(BuildChange::Create(new)) => {
                let version = tables
                    .versions
                    .get(&new.version_id)
                    .ok_or_else(|| missing("version", new.version_id))?;
                if version.tool_id != new.tool_id {
                    return Err(missing("version", new.version_id));
                }
            }
            None => {}
        }
        for change in &transition.runs {
            match change {
                RunChange::Update(run) => {
                    let stored = tables.runs.get(&run.id).ok_or_else(|| missing("run", run.id))?;
                    if stored.revision != run.revision {
                        return Err(conflict("run", run.id));
                    }
                }
                RunChange::Create(new) => {
                    if !tables.tools.contains_key(&new.tool_id) {
                        return Err(missing("tool", new.tool_id));
                    }
                    if !tables.builds.contains_key(&new.build_id) {
                        return Err(missing("build", new.build_id));
                    }
                }
            }
        }

        let now = Utc::now();
        let mut committed = Committed::default();

        if let Some(mut tool) = transition.tool {
            tool.revision += 1;
            tool.updated_at = now;
            tables.tools.insert(tool.id, tool.clone());
            committed.tool = Some(tool);
        }

        committed.build = match transition.build {
            Some(BuildChange::Update(mut build)) => {
                build.revision += 1;
                build.updated_at = now;
                tables.builds.insert(build.id, build.clone());
                Some(build)
            }
            Some(BuildChange::Create(new)) => {
                let build = Build {
                    id: BuildId(tables.allocate()),
                    tool_id: new.tool_id,
                    version_id: new.version_id,
                    status: BuildStatus::Pending,
                    logs: String::new(),
                    image_ref: None,
                    created_at: now,
                    updated_at: now,
                    revision: 0,
                };
                tables.builds.insert(build.id, build.clone());
                Some(build)
            }
            None => None,
        };

        for change in transition.runs {
            let run = match change {
                RunChange::Update(mut run) => {
                    run.revision += 1;
                    run.updated_at = now;
                    run
                }
                RunChange::Create(new) => Run {
                    id: RunId(tables.allocate()),
                    tool_id: new.tool_id,
                    build_id: new.build_id,
                    status: RunStatus::Starting,
                    container_ref: None,
                    url: None,
                    logs: String::new(),
                    created_at: now,
                    updated_at: now,
                    revision: 0,
                },
            };
            tables.runs.insert(run.id, run.clone());
            committed.runs.push(run);
        }

        Ok(committed)
    }
}
