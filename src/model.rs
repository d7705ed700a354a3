//! Entity types: Tool, Version, Build, Run.
//!
//! ```text
//! Tool ──owns──▶ Version ──owns──▶ Build
//!   │                                 ▲
//!   └──owns──▶ Run ──references───────┘
//! ```
//!
//! Every mutable entity carries a `revision`. The store bumps it on each
//! committed write and rejects writes computed from a stale copy, which
//! makes each lifecycle transition a single optimistic update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::LOG_TRUNCATED_MARKER;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw numeric identifier.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

entity_id!(
    /// Owner (user) reference. Authentication happens outside this crate.
    OwnerId
);
entity_id!(
    /// Tool identifier; also the sole input to the container name.
    ToolId
);
entity_id!(
    /// Version identifier.
    VersionId
);
entity_id!(
    /// Build identifier.
    BuildId
);
entity_id!(
    /// Run identifier.
    RunId
);

// =============================================================================
// Statuses
// =============================================================================

/// Tool lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// No build in flight and no container started by the last transition.
    #[default]
    Idle,
    /// A build has been requested and not yet completed.
    Building,
    /// The tool's container is serving.
    Running,
    /// The last build or run failed.
    Error,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Building => write!(f, "building"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Build status.
///
/// ```text
/// Pending ──▶ Running ──┬──▶ Success
///                       └──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    /// Returns true once the build can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running) | (Self::Running, Self::Success) | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Run status.
///
/// ```text
/// Starting ──┬──▶ Running ──▶ Stopped
///            ├──▶ Failed
///            └──▶ Stopped   (stopped before the start job executed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Starting,
    Running,
    Failed,
    Stopped,
}

impl RunStatus {
    /// Starting or Running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Failed)
                | (Self::Starting, Self::Stopped)
                | (Self::Running, Self::Stopped)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// The user-owned unit that is built and run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub id: ToolId,
    pub owner: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub status: ToolStatus,
    /// Set only by a successful build of one of this tool's versions.
    pub current_image_ref: Option<String>,
    /// Version that produced `current_image_ref`.
    pub current_version_id: Option<VersionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl Tool {
    /// Returns true if `owner` may issue commands against this tool.
    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner == owner
    }
}

/// Immutable snapshot of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub tool_id: ToolId,
    /// Entry-point source text.
    pub source: String,
    /// Dependency manifest, one requirement per line.
    pub manifest: String,
    /// `sha256:<hex>` over source and manifest.
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One attempt to turn a Version into an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub tool_id: ToolId,
    pub version_id: VersionId,
    pub status: BuildStatus,
    /// Append-only build output. Once it exceeds the configured cap the
    /// oldest output is replaced by [`LOG_TRUNCATED_MARKER`].
    pub logs: String,
    /// Present exactly when `status` is Success.
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl Build {
    /// Appends lines to the build log.
    pub fn append_logs<S: AsRef<str>>(&mut self, lines: &[S], max_bytes: usize) {
        for line in lines {
            append_line(&mut self.logs, line.as_ref());
        }
        truncate_log(&mut self.logs, max_bytes);
    }
}

/// One attempt to execute an image as a live instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub tool_id: ToolId,
    pub build_id: BuildId,
    pub status: RunStatus,
    pub container_ref: Option<String>,
    /// External path, `<prefix>/<tool-id>`.
    pub url: Option<String>,
    /// Append-only run output, capped like [`Build::logs`].
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl Run {
    /// Appends one line to the run log.
    pub fn append_log(&mut self, line: &str, max_bytes: usize) {
        append_line(&mut self.logs, line);
        truncate_log(&mut self.logs, max_bytes);
    }
}

// =============================================================================
// Drafts (entities before the store assigns identity)
// =============================================================================

/// Fields for a new Tool.
#[derive(Debug, Clone)]
pub struct NewTool {
    pub owner: OwnerId,
    pub name: String,
    pub description: Option<String>,
}

/// Fields for a new Version.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub tool_id: ToolId,
    pub source: String,
    pub manifest: String,
    pub digest: String,
    pub metadata: Option<serde_json::Value>,
}

/// Fields for a new Build; always created Pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBuild {
    pub tool_id: ToolId,
    pub version_id: VersionId,
}

/// Fields for a new Run; always created Starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub tool_id: ToolId,
    pub build_id: BuildId,
}

// =============================================================================
// Log helpers
// =============================================================================

fn append_line(logs: &mut String, line: &str) {
    if !logs.is_empty() {
        logs.push('\n');
    }
    logs.push_str(line);
}

/// Keeps the newest output of `logs` within `max_bytes`, replacing what was
/// cut with [`LOG_TRUNCATED_MARKER`]. Cuts on a character boundary.
pub fn truncate_log(logs: &mut String, max_bytes: usize) {
    if logs.len() <= max_bytes {
        return;
    }
    let keep = max_bytes.saturating_sub(LOG_TRUNCATED_MARKER.len());
    let mut cut = logs.len() - keep;
    while !logs.is_char_boundary(cut) {
        cut += 1;
    }
    logs.replace_range(..cut, LOG_TRUNCATED_MARKER);
}
