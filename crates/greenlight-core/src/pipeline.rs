//! Pipeline, stage and lane definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, RunId};

/// A staged promotion pipeline. Stage order is execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name; one running instance of it is a lane.
    pub name: String,
    pub stages: Vec<Stage>,
}

/// A stage in a pipeline. All actions in a stage are of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }

    /// Kind shared by every action of the stage.
    pub fn kind(&self) -> Option<StageKind> {
        self.actions.first().map(Action::kind)
    }
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Check out the triggering commit of a source repository.
    Source { repository: String },
    /// Run a build job's phases and publish its image.
    Build { job: String },
    /// Suspend until an operator approves or rejects.
    Approval { gate: String },
    /// Roll the built image out to the job's promotion target.
    Promote { job: String },
}

impl Action {
    pub fn kind(&self) -> StageKind {
        match self {
            Action::Source { .. } => StageKind::Source,
            Action::Build { .. } => StageKind::BuildAndDeploy,
            Action::Approval { .. } => StageKind::AwaitApproval,
            Action::Promote { .. } => StageKind::Promote,
        }
    }

    /// Resource this action references, if any. Approval gates are not resources.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Action::Source { repository } => Some(repository),
            Action::Build { job } | Action::Promote { job } => Some(job),
            Action::Approval { .. } => None,
        }
    }
}

/// Lane phase a stage puts the lane in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Source,
    BuildAndDeploy,
    AwaitApproval,
    Promote,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::BuildAndDeploy => write!(f, "build_and_deploy"),
            StageKind::AwaitApproval => write!(f, "await_approval"),
            StageKind::Promote => write!(f, "promote"),
        }
    }
}

impl Pipeline {
    /// Check the structural rules every lane relies on: a single leading
    /// source stage, no empty stages, and no stage mixing action kinds.
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.stages.first() else {
            return Err(Error::Configuration(format!(
                "pipeline '{}' has no stages",
                self.name
            )));
        };

        if first.kind() != Some(StageKind::Source) {
            return Err(Error::Configuration(format!(
                "pipeline '{}' must start with a source stage",
                self.name
            )));
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            let Some(kind) = stage.kind() else {
                return Err(Error::Configuration(format!(
                    "stage '{}' in pipeline '{}' has no actions",
                    stage.name, self.name
                )));
            };
            if stage.actions.iter().any(|a| a.kind() != kind) {
                return Err(Error::Configuration(format!(
                    "stage '{}' in pipeline '{}' mixes action kinds",
                    stage.name, self.name
                )));
            }
            if idx > 0 && kind == StageKind::Source {
                return Err(Error::Configuration(format!(
                    "stage '{}' in pipeline '{}': only the first stage may be a source stage",
                    stage.name, self.name
                )));
            }
        }

        Ok(())
    }

    /// Source repositories watched by this pipeline's source stage.
    pub fn source_repositories(&self) -> Vec<&str> {
        self.stages
            .first()
            .map(|stage| {
                stage
                    .actions
                    .iter()
                    .filter_map(|a| match a {
                        Action::Source { repository } => Some(repository.as_str()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Subscription of a build job to a source repository's commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitBinding {
    pub repository: String,
    pub job: String,
}

impl CommitBinding {
    pub fn new(repository: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            job: job.into(),
        }
    }
}

/// A commit pushed to a source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    /// Source repository resource name.
    pub repository: String,
    /// Commit identifier; also used as the image tag.
    pub commit: String,
    pub branch: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl CommitEvent {
    pub fn new(repository: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            commit: commit.into(),
            branch: None,
            received_at: Utc::now(),
        }
    }

    pub fn short_commit(&self) -> String {
        self.commit.chars().take(7).collect()
    }

    /// Reject commit ids that are not plain revision names.
    pub fn validate(&self) -> Result<()> {
        validate_commit_id(&self.commit)
    }
}

const MAX_COMMIT_LEN: usize = 255;

/// A commit id is 1 to 255 characters of ASCII alphanumerics and `._/-`,
/// not starting with `-`.
pub fn validate_commit_id(commit: &str) -> Result<()> {
    if commit.is_empty() || commit.len() > MAX_COMMIT_LEN {
        return Err(Error::InvalidInput(format!(
            "commit id must be 1 to {} characters",
            MAX_COMMIT_LEN
        )));
    }
    if commit.starts_with('-') {
        return Err(Error::InvalidInput(
            "commit id must not start with '-'".to_string(),
        ));
    }
    if let Some(c) = commit
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
    {
        return Err(Error::InvalidInput(format!(
            "commit id contains invalid character {:?}",
            c
        )));
    }
    Ok(())
}

/// Operator signal for a manual approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved {
        by: Option<String>,
    },
    Rejected {
        by: Option<String>,
        reason: Option<String>,
    },
}

/// State of one lane run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LaneState {
    /// Created, first stage not started yet.
    Pending,
    /// Executing a stage of the given kind.
    Running { stage: String, kind: StageKind },
    /// Suspended on a manual approval gate. No timeout.
    AwaitingApproval { stage: String, gate: String },
    /// Every stage completed.
    Done,
    /// A source, build or promotion action failed.
    Failed { stage: String, message: String },
    /// The operator rejected at a gate.
    Rejected {
        stage: String,
        gate: String,
        reason: Option<String>,
    },
}

impl LaneState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LaneState::Done | LaneState::Failed { .. } | LaneState::Rejected { .. }
        )
    }

    pub fn is_awaiting_approval(&self) -> bool {
        matches!(self, LaneState::AwaitingApproval { .. })
    }
}

impl std::fmt::Display for LaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaneState::Pending => write!(f, "pending"),
            LaneState::Running { stage, kind } => write!(f, "{} ({})", kind, stage),
            LaneState::AwaitingApproval { stage, gate } => {
                write!(f, "awaiting approval '{}' ({})", gate, stage)
            }
            LaneState::Done => write!(f, "done"),
            LaneState::Failed { stage, message } => write!(f, "failed at {}: {}", stage, message),
            LaneState::Rejected { stage, gate, .. } => {
                write!(f, "rejected at gate '{}' ({})", gate, stage)
            }
        }
    }
}

/// Summary of a finished lane run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneRun {
    pub id: RunId,
    pub lane: String,
    pub commit: CommitEvent,
    pub state: LaneState,
    /// Stages that ran to completion, in order.
    pub completed_stages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
