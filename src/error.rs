//! Error types for the tool lifecycle orchestrator.
//!
//! Errors fall into the four categories the control plane distinguishes:
//!
//! | Category      | Variants                                  | Retried? |
//! |---------------|-------------------------------------------|----------|
//! | Validation    | [`Error::Packaging`]                      | never    |
//! | Precondition  | [`Error::Precondition`], [`Error::ToolNotFound`] | caller resubmits |
//! | Orchestration | [`Error::BuildFailed`], [`Error::RunFailed`], ... | never (terminal transition) |
//! | Not found     | [`Error::ContainerNotFound`]              | never    |
//!
//! Storage conflicts and dispatcher faults are infrastructure errors; only
//! those ever reach the dispatcher as a failed job.

use std::path::PathBuf;

use crate::packaging::PackagingError;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Submitted artifact rejected by the packaging validator.
    #[error(transparent)]
    Packaging(#[from] PackagingError),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Command issued against an entity whose state forbids it.
    #[error("{0}")]
    Precondition(String),

    /// Tool does not exist or is not owned by the caller.
    #[error("Tool not found")]
    ToolNotFound,

    /// A state transition the lifecycle does not allow.
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    /// Image build failed; carries whatever build output was captured.
    #[error("failed to build image '{image}': {reason}")]
    BuildFailed {
        image: String,
        reason: String,
        logs: Vec<String>,
    },

    /// Container start failed.
    #[error("failed to run container '{container}': {reason}")]
    RunFailed { container: String, reason: String },

    /// Container stop or removal failed.
    #[error("failed to stop container '{container}': {reason}")]
    StopFailed { container: String, reason: String },

    /// No container exists under the tool's deterministic name.
    #[error("Container not running: {0}")]
    ContainerNotFound(String),

    /// Container runtime binary missing or daemon unreachable.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Runtime call exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Optimistic revision check failed; another transition won the race.
    #[error("{entity} {id} was modified concurrently")]
    Conflict { entity: &'static str, id: String },

    /// Referenced entity does not exist in the store.
    #[error("{entity} {id} not found")]
    EntityNotFound { entity: &'static str, id: String },

    // =========================================================================
    // Dispatch Errors
    // =========================================================================
    /// The job queue has been shut down.
    #[error("dispatcher closed; job '{0}' not enqueued")]
    DispatcherClosed(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration value rejected.
    #[error("invalid configuration '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Configuration file could not be read or parsed.
    #[error("failed to load configuration from {path}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a precondition rejection with a human-readable reason.
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition(reason.into())
    }

    /// Returns true for unsafe or malformed submissions.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Packaging(_))
    }

    /// Returns true when the command was rejected because of entity state.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::ToolNotFound)
    }

    /// Returns true for runtime-call failures.
    pub fn is_orchestration(&self) -> bool {
        matches!(
            self,
            Self::BuildFailed { .. }
                | Self::RunFailed { .. }
                | Self::StopFailed { .. }
                | Self::ContainerNotFound(_)
                | Self::RuntimeUnavailable { .. }
                | Self::Timeout { .. }
        )
    }

    /// Returns true when a stop found no container to act on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }

    /// Returns true for optimistic-concurrency losses.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Captured runtime output attached to this error, if any.
    pub fn logs(&self) -> &[String] {
        match self {
            Self::BuildFailed { logs, .. } => logs,
            _ => &[],
        }
    }
}
