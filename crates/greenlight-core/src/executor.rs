//! Build executor trait and build invocation types.
//!
//! Executors run a build specification in an isolated environment and report
//! only its terminal outcome plus a log stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::buildspec::BuildSpec;
use crate::{Result, RunId};

/// One execution of a build job.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInvocation {
    /// Unique identifier for this invocation.
    pub id: RunId,
    /// Build job resource name.
    pub job: String,
    /// Image the build runs in.
    pub image: String,
    /// Run the container privileged (needed for docker builds).
    pub privileged: bool,
    /// Phases and resolved environment.
    pub spec: BuildSpec,
    /// Commit to check out before the first phase.
    pub source: Option<SourceCheckout>,
}

/// Source to clone before the build runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckout {
    pub clone_url: String,
    pub commit: String,
    /// Directory to clone into.
    pub target_dir: String,
}

/// Handle to a running or completed build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: RunId,
    /// Executor-specific identifier (e.g., container ID).
    pub executor_id: String,
    pub executor_name: String,
}

/// Status of a build execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. })
    }
}

/// Result of a completed build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

/// A line of build output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Image published by a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Registry repository URI.
    pub repository: String,
    /// Tag, the commit identifier.
    pub tag: String,
}

impl ArtifactRef {
    pub fn image(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Trait for build executors.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Start a build.
    async fn spawn(&self, invocation: BuildInvocation) -> Result<JobHandle>;

    /// Stream log lines from a build.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Current status of a build.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a build to finish.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Cancel a running build and release what it holds.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Release what a finished build holds. Called once its result and logs
    /// have been read.
    async fn cleanup(&self, _handle: &JobHandle) -> Result<()> {
        Ok(())
    }
}
