//! # sheetify
//!
//! **Tool Lifecycle Orchestrator**
//!
//! Turns a submitted single-file data-analysis script into a container image
//! and runs that image as an isolated web service behind a path-routing
//! reverse proxy. At most one container runs per tool, on one runtime host.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           sheetify                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      Orchestrator                           │    │
//! │  │  create_tool │ upload_version │ request_build/run/stop      │    │
//! │  └──────┬──────────────────┬───────────────────────┬──────────┘    │
//! │         │                  │                       │               │
//! │  ┌──────▼──────┐   ┌───────▼────────┐    ┌─────────▼─────────┐     │
//! │  │  Packaging  │   │   Lifecycle    │    │    Dispatcher     │     │
//! │  │  Validator  │   │ State Machine  │    │ (at-least-once)   │     │
//! │  │ denylist,   │   │ pure begin_*/  │    │ JobQueue worker   │     │
//! │  │ manifest    │   │ complete_*     │    └─────────┬─────────┘     │
//! │  └─────────────┘   └───────┬────────┘              │               │
//! │                    ┌───────▼────────┐    ┌─────────▼─────────┐     │
//! │                    │     Store      │    │ Orchestration     │     │
//! │                    │ atomic commit, │    │ Client            │     │
//! │                    │ revisions      │    │ build/run/stop    │     │
//! │                    └────────────────┘    └─────────┬─────────┘     │
//! ├────────────────────────────────────────────────────┼───────────────┤
//! │                 ContainerDriver (DockerDriver)     ▼               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tool Lifecycle
//!
//! ```text
//!               request_build             build ok
//!   Idle/Error ───────────────▶ Building ───────────▶ Idle (image set)
//!                                  └── build failed ──▶ Error
//!
//!          run ok                 stop
//!   any ───────────▶ Running ─────────────▶ Idle
//!   any ── run failed ──▶ Error
//! ```
//!
//! # Security Model
//!
//! - **Import Denylist**: uploads whose entry point mentions a
//!   process-spawning, raw-socket or remote-shell module are rejected before
//!   anything is stored (see [`constants::DANGEROUS_IMPORTS`]).
//! - **Bounded Uploads**: archives are limited in total size, entry count and
//!   per-entry size.
//! - **Container Posture**: every tool container runs with
//!   `no-new-privileges` and without `NET_RAW`.
//! - **Deterministic Identity**: a tool's container name depends on its id
//!   alone ([`ContainerName`]), so a new run always replaces the old one.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sheetify::{DockerDriver, MemoryStore, Orchestrator, OrchestratorConfig, OwnerId, QueueDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> sheetify::Result<()> {
//!     let config = Arc::new(OrchestratorConfig::load(None)?);
//!     let (dispatcher, queue) = QueueDispatcher::new();
//!     let orchestrator = Arc::new(Orchestrator::new(
//!         Arc::clone(&config),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(DockerDriver::new(&config)),
//!         Arc::new(dispatcher),
//!     ));
//!     queue.spawn(orchestrator.clone(), config.max_job_attempts);
//!
//!     let owner = OwnerId(1);
//!     let tool = orchestrator.create_tool(owner, "explorer", None).await?;
//!     orchestrator.upload_version(owner, tool.id, "app.py", b"import pandas", None).await?;
//!     orchestrator.request_build(owner, tool.id, None).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod constants;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod packaging;
pub mod store;

// Re-exports
pub use client::OrchestrationClient;
pub use config::OrchestratorConfig;
pub use context::{BuildContext, render_dockerfile};
pub use dispatch::{Dispatcher, Job, JobEnvelope, JobHandler, JobId, JobQueue, QueueDispatcher};
pub use driver::{ContainerDriver, ContainerName, ContainerSpec, DockerDriver, ImageBuild};
pub use error::{Error, Result};
pub use lifecycle::{BuildOutcome, RunOutcome, StopDecision};
pub use model::{
    Build, BuildId, BuildStatus, OwnerId, Run, RunId, RunStatus, Tool, ToolId, ToolStatus,
    Version, VersionId,
};
pub use orchestrator::{Acceptance, CommandReceipt, Orchestrator, ToolDetail, VersionDetail};
pub use packaging::{PackagedSource, PackagingError, validate};
pub use store::{MemoryStore, Store, Transition};
