//! # Task Dispatcher
//!
//! Control-plane commands hand runtime work to a [`Dispatcher`] and return
//! immediately. Jobs are delivered at least once to a [`JobHandler`]:
//!
//! ```text
//! enqueue(Job) ──▶ mpsc queue ──▶ worker ──▶ handler.handle(job)
//!                                   │              │
//!                                   │        Err (infrastructure)
//!                                   │              │
//!                                   └── retry up to max_attempts
//! ```
//!
//! Runtime failures never surface here; the handler turns them into terminal
//! transitions and returns `Ok`. Only store or queue faults come back as
//! `Err` and trigger a re-delivery, so handlers must be idempotent.
//!
//! Jobs for different tools run concurrently with no ordering guarantee.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::constants::{JOB_QUEUE_CAPACITY, JOB_RETRY_BACKOFF};
use crate::error::{Error, Result};
use crate::model::{BuildId, RunId, ToolId};

// =============================================================================
// Jobs
// =============================================================================

/// Unit of deferred runtime work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Build { tool_id: ToolId, build_id: BuildId },
    Run { tool_id: ToolId, run_id: RunId },
    Stop { tool_id: ToolId },
}

impl Job {
    pub fn tool_id(&self) -> ToolId {
        match self {
            Self::Build { tool_id, .. } | Self::Run { tool_id, .. } | Self::Stop { tool_id } => {
                *tool_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Run { .. } => "run",
            Self::Stop { .. } => "stop",
        }
    }
}

/// Time-ordered job identifier (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub job: Job,
    /// Delivery number, starting at 1.
    pub attempt: u32,
}

// =============================================================================
// Traits
// =============================================================================

/// Accepts fire-and-forget jobs.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queues `job`; returns once the job is accepted, not once it has run.
    async fn enqueue(&self, job: Job) -> Result<JobId>;
}

/// Executes delivered jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// `Err` means an infrastructure fault; the job will be delivered again.
    async fn handle(&self, job: &Job) -> Result<()>;
}

// =============================================================================
// In-process queue
// =============================================================================

/// Sending half of the in-process job queue.
#[derive(Debug, Clone)]
pub struct QueueDispatcher {
    tx: mpsc::Sender<JobEnvelope>,
}

/// Receiving half of the in-process job queue.
#[derive(Debug)]
pub struct JobQueue {
    rx: mpsc::Receiver<JobEnvelope>,
    backoff: Duration,
}

impl QueueDispatcher {
    /// Creates a dispatcher and the queue its jobs arrive on.
    pub fn new() -> (Self, JobQueue) {
        let (tx, rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        (
            Self { tx },
            JobQueue {
                rx,
                backoff: JOB_RETRY_BACKOFF,
            },
        )
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let envelope = JobEnvelope {
            id: JobId::new(),
            job,
            attempt: 1,
        };
        let id = envelope.id;
        debug!(job_id = %id, kind = envelope.job.kind(), tool_id = %envelope.job.tool_id(), "job enqueued");
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::DispatcherClosed(id.to_string()))?;
        Ok(id)
    }
}

impl JobQueue {
    /// Sets the delay between deliveries of a failing job.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs every job on its own task until all dispatchers are dropped.
    pub fn spawn(mut self, handler: Arc<dyn JobHandler>, max_attempts: u32) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = self.rx.recv().await {
                let handler = Arc::clone(&handler);
                let backoff = self.backoff;
                tokio::spawn(async move {
                    deliver(handler.as_ref(), envelope, max_attempts, backoff).await;
                });
            }
            debug!("job queue closed");
        })
    }

    /// Drains queued jobs on the current task, one at a time. Returns the
    /// number of jobs processed.
    pub async fn run_pending(&mut self, handler: &dyn JobHandler, max_attempts: u32) -> usize {
        let mut processed = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            deliver(handler, envelope, max_attempts, self.backoff).await;
            processed += 1;
        }
        processed
    }
}

/// Delivers one job until it succeeds or runs out of attempts.
async fn deliver(handler: &dyn JobHandler, mut envelope: JobEnvelope, max_attempts: u32, backoff: Duration) {
    loop {
        match handler.handle(&envelope.job).await {
            Ok(()) => {
                debug!(job_id = %envelope.id, kind = envelope.job.kind(), attempt = envelope.attempt, "job done");
                return;
            }
            Err(e) if envelope.attempt < max_attempts => {
                warn!(
                    job_id = %envelope.id,
                    kind = envelope.job.kind(),
                    attempt = envelope.attempt,
                    "job failed, retrying: {}", e
                );
                envelope.attempt += 1;
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
            Err(e) => {
                error!(
                    job_id = %envelope.id,
                    kind = envelope.job.kind(),
                    tool_id = %envelope.job.tool_id(),
                    attempts = envelope.attempt,
                    "job abandoned: {}", e
                );
                return;
            }
        }
    }
}
