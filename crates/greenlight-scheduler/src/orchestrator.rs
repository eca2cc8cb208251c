//! Pipeline orchestrator: drives one lane per pipeline through
//! source, build-and-deploy, approval and promotion.
//!
//! Each lane runs in its own task and owns its state; callers observe it
//! through a [`LaneHandle`]. The approval gate is the only point where a
//! lane suspends, and it waits without a timeout.

use crate::runner::BuildJobRunner;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use greenlight_config::LaneContext;
use greenlight_core::deployer::PromotionDecision;
use greenlight_core::executor::{ArtifactRef, LogLine};
use greenlight_core::pipeline::{
    Action, ApprovalDecision, CommitEvent, LaneRun, LaneState, Pipeline, Stage, StageKind,
};
use greenlight_core::{Error, Result, RunId};
use greenlight_deployer::Promoter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Event emitted while a lane runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    LaneStarted {
        lane: String,
        run_id: RunId,
        commit: String,
    },
    StageStarted {
        lane: String,
        stage: String,
        kind: StageKind,
    },
    BuildLog {
        lane: String,
        job: String,
        line: LogLine,
    },
    BuildCompleted {
        lane: String,
        job: String,
        artifact: Option<ArtifactRef>,
    },
    ApprovalRequested {
        lane: String,
        stage: String,
        gate: String,
    },
    ApprovalReceived {
        lane: String,
        gate: String,
        decision: ApprovalDecision,
    },
    Promoted {
        lane: String,
        job: String,
        decision: PromotionDecision,
    },
    StageCompleted {
        lane: String,
        stage: String,
    },
    LaneCompleted {
        lane: String,
        state: LaneState,
    },
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("lane '{0}' has not run")]
    UnknownLane(String),

    #[error("lane '{lane}' is not awaiting approval ({state})")]
    NotAwaiting { lane: String, state: LaneState },

    #[error("lane '{0}' no longer accepts approvals")]
    Closed(String),
}

impl From<ApprovalError> for Error {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::UnknownLane(_) => Error::NotFound(err.to_string()),
            ApprovalError::NotAwaiting { .. } | ApprovalError::Closed(_) => {
                Error::Conflict(err.to_string())
            }
        }
    }
}

/// Current view of a lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneSummary {
    pub lane: String,
    pub run_id: RunId,
    pub repository: String,
    pub commit: String,
    pub state: LaneState,
    pub started_at: DateTime<Utc>,
}

/// Observes one lane run and delivers approval decisions to it.
#[derive(Clone)]
pub struct LaneHandle {
    lane: String,
    run_id: RunId,
    commit: CommitEvent,
    started_at: DateTime<Utc>,
    state: watch::Receiver<LaneState>,
    approvals: mpsc::UnboundedSender<ApprovalDecision>,
}

impl LaneHandle {
    pub fn lane(&self) -> &str {
        &self.lane
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn commit(&self) -> &CommitEvent {
        &self.commit
    }

    pub fn state(&self) -> LaneState {
        self.state.borrow().clone()
    }

    pub fn summary(&self) -> LaneSummary {
        LaneSummary {
            lane: self.lane.clone(),
            run_id: self.run_id,
            repository: self.commit.repository.clone(),
            commit: self.commit.commit.clone(),
            state: self.state(),
            started_at: self.started_at,
        }
    }

    /// Deliver a decision to the gate the lane is waiting on.
    pub fn decide(&self, decision: ApprovalDecision) -> std::result::Result<(), ApprovalError> {
        let state = self.state();
        if !state.is_awaiting_approval() {
            return Err(ApprovalError::NotAwaiting {
                lane: self.lane.clone(),
                state,
            });
        }
        self.approvals
            .send(decision)
            .map_err(|_| ApprovalError::Closed(self.lane.clone()))
    }

    pub fn approve(&self, by: Option<String>) -> std::result::Result<(), ApprovalError> {
        self.decide(ApprovalDecision::Approved { by })
    }

    pub fn reject(
        &self,
        by: Option<String>,
        reason: Option<String>,
    ) -> std::result::Result<(), ApprovalError> {
        self.decide(ApprovalDecision::Rejected { by, reason })
    }

    /// Wait until the lane state satisfies `f`, or the lane ends.
    pub async fn wait_for(&self, f: impl FnMut(&LaneState) -> bool) -> LaneState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(f).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| self.state())
    }
}

/// A started lane: its handle, its event stream and the task running it.
pub struct LaneStart {
    pub handle: LaneHandle,
    pub events: mpsc::Receiver<PipelineEvent>,
    pub run: JoinHandle<LaneRun>,
}

/// Starts and tracks pipeline lanes. One run per lane at a time.
pub struct PipelineOrchestrator {
    runner: Arc<BuildJobRunner>,
    promoter: Promoter,
    lanes: Mutex<HashMap<String, LaneHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineOrchestrator {
    pub fn new(runner: Arc<BuildJobRunner>, promoter: Promoter) -> Self {
        Self {
            runner,
            promoter,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Handle of the latest run of `lane`.
    pub fn lane(&self, lane: &str) -> Option<LaneHandle> {
        lock(&self.lanes).get(lane).cloned()
    }

    /// Latest run of every lane, by lane name.
    pub fn lanes(&self) -> Vec<LaneSummary> {
        let mut lanes: Vec<_> = lock(&self.lanes).values().map(LaneHandle::summary).collect();
        lanes.sort_by(|a, b| a.lane.cmp(&b.lane));
        lanes
    }

    pub fn decide(
        &self,
        lane: &str,
        decision: ApprovalDecision,
    ) -> std::result::Result<(), ApprovalError> {
        let handle = self
            .lane(lane)
            .ok_or_else(|| ApprovalError::UnknownLane(lane.to_string()))?;
        handle.decide(decision)
    }

    /// Start the pipeline named `lane` for a commit of one of its source
    /// repositories. Fails with `Conflict` while a previous run of the lane
    /// has not finished.
    pub fn start_lane(&self, lane: &str, event: CommitEvent) -> Result<LaneStart> {
        event.validate()?;
        let topology = self.runner.topology();
        let pipeline = topology
            .pipeline(lane)
            .ok_or_else(|| Error::NotFound(format!("pipeline {}", lane)))?
            .clone();
        if !self.runner.report().is_ready(lane) {
            return Err(Error::Conflict(format!(
                "pipeline '{}' is not provisioned",
                lane
            )));
        }
        if !pipeline
            .source_repositories()
            .contains(&event.repository.as_str())
        {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' does not watch '{}'",
                lane, event.repository
            )));
        }

        let mut lanes = lock(&self.lanes);
        if let Some(current) = lanes.get(lane) {
            if !current.state().is_terminal() {
                return Err(Error::Conflict(format!(
                    "lane '{}' is still running commit {}",
                    lane,
                    current.commit.short_commit()
                )));
            }
        }

        let (state_tx, state_rx) = watch::channel(LaneState::Pending);
        let (approval_tx, approval_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(100);

        let handle = LaneHandle {
            lane: lane.to_string(),
            run_id: RunId::new(),
            commit: event.clone(),
            started_at: Utc::now(),
            state: state_rx,
            approvals: approval_tx,
        };
        lanes.insert(lane.to_string(), handle.clone());
        drop(lanes);

        let task = LaneTask {
            runner: self.runner.clone(),
            promoter: self.promoter.clone(),
            lane: lane.to_string(),
            run_id: handle.run_id,
            started_at: handle.started_at,
            pipeline,
            event,
            state: state_tx,
            approvals: approval_rx,
            events: tx,
        };
        let run = tokio::spawn(task.run());

        Ok(LaneStart {
            handle,
            events: rx,
            run,
        })
    }

    /// Start every lane whose source stage watches the commit's repository.
    /// Their events are logged and the runs continue in the background.
    pub fn start_watching(&self, event: &CommitEvent) -> Vec<(String, Result<RunId>)> {
        let lanes: Vec<String> = self
            .runner
            .topology()
            .pipelines_watching(&event.repository)
            .map(|p| p.name.clone())
            .collect();

        lanes
            .into_iter()
            .map(|lane| {
                let started = self.start_lane(&lane, event.clone()).map(|start| {
                    tokio::spawn(log_events(start.events));
                    start.handle.run_id()
                });
                if let Err(e) = &started {
                    warn!(lane = %lane, commit = %event.short_commit(), error = %e, "Lane not started");
                }
                (lane, started)
            })
            .collect()
    }
}

/// Log a lane's events until the lane ends.
pub async fn log_events(mut events: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::BuildLog { lane, job, line } => {
                debug!(lane = %lane, job = %job, "{}", line.content);
            }
            PipelineEvent::StageStarted { lane, stage, kind } => {
                info!(lane = %lane, stage = %stage, kind = %kind, "Stage started");
            }
            PipelineEvent::ApprovalRequested { lane, gate, .. } => {
                info!(lane = %lane, gate = %gate, "Awaiting approval");
            }
            PipelineEvent::Promoted { lane, job, decision } => {
                info!(lane = %lane, job = %job, decision = ?decision, "Promoted");
            }
            PipelineEvent::LaneCompleted { lane, state } => {
                info!(lane = %lane, state = %state, "Lane finished");
            }
            other => debug!(event = ?other, "Lane event"),
        }
    }
}

/// Everything one lane run owns.
struct LaneTask {
    runner: Arc<BuildJobRunner>,
    promoter: Promoter,
    lane: String,
    run_id: RunId,
    started_at: DateTime<Utc>,
    pipeline: Pipeline,
    event: CommitEvent,
    state: watch::Sender<LaneState>,
    approvals: mpsc::UnboundedReceiver<ApprovalDecision>,
    events: mpsc::Sender<PipelineEvent>,
}

/// Ends the lane with the given terminal state.
type StageResult = std::result::Result<(), LaneState>;

impl LaneTask {
    async fn run(mut self) -> LaneRun {
        info!(lane = %self.lane, commit = %self.event.short_commit(), run_id = %self.run_id, "Lane started");
        self.emit(PipelineEvent::LaneStarted {
            lane: self.lane.clone(),
            run_id: self.run_id,
            commit: self.event.commit.clone(),
        })
        .await;

        let stages = self.pipeline.stages.clone();
        let mut completed = Vec::new();
        let mut artifacts: HashMap<String, ArtifactRef> = HashMap::new();
        let mut outcome = LaneState::Done;

        for stage in &stages {
            let Some(kind) = stage.kind() else {
                outcome = LaneState::Failed {
                    stage: stage.name.clone(),
                    message: "stage has no actions".to_string(),
                };
                break;
            };

            if kind != StageKind::AwaitApproval {
                self.set_state(LaneState::Running {
                    stage: stage.name.clone(),
                    kind,
                });
            }
            self.emit(PipelineEvent::StageStarted {
                lane: self.lane.clone(),
                stage: stage.name.clone(),
                kind,
            })
            .await;

            let result = match kind {
                StageKind::Source => self.source(stage),
                StageKind::BuildAndDeploy => self.build(stage, &mut artifacts).await,
                StageKind::AwaitApproval => self.await_approval(stage).await,
                StageKind::Promote => self.promote(stage, &artifacts).await,
            };

            if let Err(terminal) = result {
                outcome = terminal;
                break;
            }

            completed.push(stage.name.clone());
            self.emit(PipelineEvent::StageCompleted {
                lane: self.lane.clone(),
                stage: stage.name.clone(),
            })
            .await;
        }

        match &outcome {
            LaneState::Done => info!(lane = %self.lane, "Lane done"),
            LaneState::Rejected { gate, .. } => info!(lane = %self.lane, gate = %gate, "Lane rejected"),
            other => error!(lane = %self.lane, state = %other, "Lane failed"),
        }
        self.set_state(outcome.clone());
        self.emit(PipelineEvent::LaneCompleted {
            lane: self.lane.clone(),
            state: outcome.clone(),
        })
        .await;

        LaneRun {
            id: self.run_id,
            lane: self.lane,
            commit: self.event,
            state: outcome,
            completed_stages: completed,
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
        }
    }

    fn source(&self, stage: &Stage) -> StageResult {
        let report = self.runner.report();
        for action in &stage.actions {
            if let Action::Source { repository } = action {
                if !report.is_ready(repository) {
                    return Err(self.failed(
                        stage,
                        format!("source repository '{}' is not ready", repository),
                    ));
                }
            }
        }
        info!(
            lane = %self.lane,
            repository = %self.event.repository,
            commit = %self.event.short_commit(),
            "Source ready"
        );
        Ok(())
    }

    /// Run every build of the stage concurrently; the stage fails if any does.
    async fn build(
        &self,
        stage: &Stage,
        artifacts: &mut HashMap<String, ArtifactRef>,
    ) -> StageResult {
        let lane_ctx = LaneContext {
            name: self.lane.clone(),
            stage: stage.name.clone(),
        };
        let runner = &self.runner;
        let events = &self.events;
        let event = &self.event;
        let lane = &self.lane;
        let lane_ctx = &lane_ctx;

        let builds = stage.actions.iter().filter_map(|action| match action {
            Action::Build { job } => Some(job),
            _ => None,
        });
        let results = join_all(builds.map(|job| async move {
            let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(100);
            let forward = async {
                while let Some(line) = log_rx.recv().await {
                    let _ = events
                        .send(PipelineEvent::BuildLog {
                            lane: lane.clone(),
                            job: job.clone(),
                            line,
                        })
                        .await;
                }
            };
            let (result, ()) = tokio::join!(runner.run(job, event, lane_ctx, Some(log_tx)), forward);
            (job, result)
        }))
        .await;

        let mut failure = None;
        for (job, result) in results {
            match result {
                Ok(record) => {
                    self.emit(PipelineEvent::BuildCompleted {
                        lane: self.lane.clone(),
                        job: job.clone(),
                        artifact: record.artifact.clone(),
                    })
                    .await;
                    if let Some(artifact) = record.artifact {
                        artifacts.insert(job.clone(), artifact);
                    }
                }
                Err(e) => {
                    failure.get_or_insert_with(|| e.to_string());
                }
            }
        }

        match failure {
            Some(message) => Err(self.failed(stage, message)),
            None => Ok(()),
        }
    }

    /// Wait on each gate of the stage in turn. Decisions that arrived before
    /// the gate opened are discarded.
    async fn await_approval(&mut self, stage: &Stage) -> StageResult {
        let gates: Vec<String> = stage
            .actions
            .iter()
            .filter_map(|action| match action {
                Action::Approval { gate } => Some(gate.clone()),
                _ => None,
            })
            .collect();

        for gate in gates {
            while self.approvals.try_recv().is_ok() {}

            self.set_state(LaneState::AwaitingApproval {
                stage: stage.name.clone(),
                gate: gate.clone(),
            });
            self.emit(PipelineEvent::ApprovalRequested {
                lane: self.lane.clone(),
                stage: stage.name.clone(),
                gate: gate.clone(),
            })
            .await;
            info!(lane = %self.lane, gate = %gate, "Waiting for approval");

            let Some(decision) = self.approvals.recv().await else {
                return Err(self.failed(stage, "approval channel closed".to_string()));
            };
            self.emit(PipelineEvent::ApprovalReceived {
                lane: self.lane.clone(),
                gate: gate.clone(),
                decision: decision.clone(),
            })
            .await;

            match decision {
                ApprovalDecision::Approved { by } => {
                    info!(lane = %self.lane, gate = %gate, by = ?by, "Approved");
                }
                ApprovalDecision::Rejected { by, reason } => {
                    info!(lane = %self.lane, gate = %gate, by = ?by, reason = ?reason, "Rejected");
                    return Err(LaneState::Rejected {
                        stage: stage.name.clone(),
                        gate,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    async fn promote(&self, stage: &Stage, artifacts: &HashMap<String, ArtifactRef>) -> StageResult {
        let jobs = stage.actions.iter().filter_map(|action| match action {
            Action::Promote { job } => Some(job),
            _ => None,
        });
        let results = join_all(jobs.map(|job| async move {
            let result = self.promote_job(job, artifacts).await;
            (job, result)
        }))
        .await;

        let mut failure = None;
        for (job, result) in results {
            match result {
                Ok(decision) => {
                    self.emit(PipelineEvent::Promoted {
                        lane: self.lane.clone(),
                        job: job.clone(),
                        decision,
                    })
                    .await;
                }
                Err(e) => {
                    failure.get_or_insert_with(|| format!("promotion of '{}': {}", job, e));
                }
            }
        }

        match failure {
            Some(message) => Err(self.failed(stage, message)),
            None => Ok(()),
        }
    }

    async fn promote_job(
        &self,
        job: &str,
        artifacts: &HashMap<String, ArtifactRef>,
    ) -> Result<PromotionDecision> {
        let target = self
            .runner
            .topology()
            .build_job(job)
            .and_then(|spec| spec.promotion.clone())
            .ok_or_else(|| Error::DeploymentFailed(format!("'{}' has no promotion target", job)))?;
        let artifact = artifacts
            .get(job)
            .cloned()
            .or_else(|| self.runner.artifact_for(job, &self.event.commit))
            .ok_or_else(|| {
                Error::DeploymentFailed(format!("no image of '{}' for commit {}", job, self.event.commit))
            })?;

        self.promoter.promote(&target, &artifact.image()).await
    }

    fn failed(&self, stage: &Stage, message: String) -> LaneState {
        LaneState::Failed {
            stage: stage.name.clone(),
            message,
        }
    }

    fn set_state(&self, state: LaneState) {
        debug!(lane = %self.lane, state = %state, "Lane state");
        self.state.send_replace(state);
    }

    async fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::provisioned;
    use greenlight_deployer::{ClusterOperation, MemoryCluster};
    use greenlight_executor::DryRunExecutor;

    struct Harness {
        orchestrator: PipelineOrchestrator,
        cluster: Arc<MemoryCluster>,
        executor: Arc<DryRunExecutor>,
    }

    async fn harness(executor: DryRunExecutor) -> Harness {
        harness_on(executor, MemoryCluster::new()).await
    }

    async fn harness_on(executor: DryRunExecutor, cluster: MemoryCluster) -> Harness {
        let (topology, report) = provisioned().await;
        let executor = Arc::new(executor);
        let cluster = Arc::new(cluster);
        let runner = Arc::new(BuildJobRunner::new(executor.clone(), topology, report));
        Harness {
            orchestrator: PipelineOrchestrator::new(runner, Promoter::new(cluster.clone())),
            cluster,
            executor,
        }
    }

    fn settled(state: &LaneState) -> bool {
        state.is_awaiting_approval() || state.is_terminal()
    }

    async fn collect(mut events: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut all = Vec::new();
        while let Some(event) = events.recv().await {
            all.push(event);
        }
        all
    }

    #[tokio::test]
    async fn test_lane_promotes_after_approval() {
        let h = harness(DryRunExecutor::new()).await;
        let start = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "abc1234"))
            .unwrap();

        let state = start.handle.wait_for(settled).await;
        assert_eq!(
            state,
            LaneState::AwaitingApproval {
                stage: "ApproveSwapBG".to_string(),
                gate: "Approve".to_string(),
            }
        );
        assert!(h.cluster.operations().is_empty());

        h.orchestrator
            .decide("front", ApprovalDecision::Approved { by: Some("ops".to_string()) })
            .unwrap();
        let run = start.run.await.unwrap();

        assert_eq!(run.state, LaneState::Done);
        assert_eq!(
            run.completed_stages,
            vec!["Source", "BuildAndDeploy", "ApproveSwapBG", "SwapBG"]
        );
        let image = h.cluster.image_of("rolling-front").unwrap();
        assert!(image.ends_with(":abc1234"));

        let events = collect(start.events).await;
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Promoted {
                decision: PromotionDecision::ApplyManifest(_),
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::BuildLog { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::LaneCompleted {
                state: LaneState::Done,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_build_failure_halts_lane() {
        let h = harness(DryRunExecutor::new().fail_job("build-front")).await;
        let start = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "abc1234"))
            .unwrap();

        let run = start.run.await.unwrap();
        match &run.state {
            LaneState::Failed { stage, message } => {
                assert_eq!(stage, "BuildAndDeploy");
                assert!(message.contains("dry-run failure"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(run.completed_stages, vec!["Source"]);
        assert!(h.cluster.operations().is_empty());

        let events = collect(start.events).await;
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, PipelineEvent::ApprovalRequested { .. }))
        );
    }

    #[tokio::test]
    async fn test_failed_build_reruns_when_lane_restarts() {
        let h = harness(DryRunExecutor::new().fail_job("build-front")).await;

        for attempt in 1..=2 {
            let start = h
                .orchestrator
                .start_lane("front", CommitEvent::new("repo-front", "abc1234"))
                .unwrap();
            let run = start.run.await.unwrap();
            assert!(matches!(run.state, LaneState::Failed { .. }));
            assert_eq!(h.executor.spawned("build-front"), attempt);
        }
    }

    #[tokio::test]
    async fn test_promotion_failure_fails_lane() {
        let h = harness_on(DryRunExecutor::new(), MemoryCluster::new().fail_apply()).await;
        let start = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "abc1234"))
            .unwrap();

        assert!(start.handle.wait_for(settled).await.is_awaiting_approval());
        start.handle.approve(None).unwrap();
        let run = start.run.await.unwrap();

        match &run.state {
            LaneState::Failed { stage, message } => {
                assert_eq!(stage, "SwapBG");
                assert!(message.contains("promotion of 'build-front'"));
                assert!(message.contains("cluster refused manifest"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(
            run.completed_stages,
            vec!["Source", "BuildAndDeploy", "ApproveSwapBG"]
        );
        assert!(h.cluster.image_of("rolling-front").is_none());

        let events = collect(start.events).await;
        assert!(!events.iter().any(|e| matches!(e, PipelineEvent::Promoted { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::LaneCompleted {
                state: LaneState::Failed { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rejection_skips_promotion() {
        let h = harness(DryRunExecutor::new()).await;
        let start = h
            .orchestrator
            .start_lane("back", CommitEvent::new("repo-back", "abc1234"))
            .unwrap();

        start.handle.wait_for(settled).await;
        start
            .handle
            .reject(None, Some("not today".to_string()))
            .unwrap();
        let run = start.run.await.unwrap();

        assert_eq!(
            run.state,
            LaneState::Rejected {
                stage: "ApproveSwapBG".to_string(),
                gate: "Approve".to_string(),
                reason: Some("not today".to_string()),
            }
        );
        assert!(h.cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn test_lanes_await_approval_independently() {
        let h = harness(DryRunExecutor::new()).await;
        let front = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "f000001"))
            .unwrap();
        let back = h
            .orchestrator
            .start_lane("back", CommitEvent::new("repo-back", "b000001"))
            .unwrap();

        assert!(front.handle.wait_for(settled).await.is_awaiting_approval());
        assert!(back.handle.wait_for(settled).await.is_awaiting_approval());

        h.orchestrator
            .decide("back", ApprovalDecision::Approved { by: None })
            .unwrap();
        assert_eq!(back.run.await.unwrap().state, LaneState::Done);
        assert!(h.orchestrator.lane("front").unwrap().state().is_awaiting_approval());

        h.orchestrator
            .decide(
                "front",
                ApprovalDecision::Rejected {
                    by: None,
                    reason: None,
                },
            )
            .unwrap();
        assert!(matches!(
            front.run.await.unwrap().state,
            LaneState::Rejected { .. }
        ));

        assert!(h.cluster.image_of("rolling-back").is_some());
        assert!(h.cluster.image_of("rolling-front").is_none());
        assert_eq!(h.executor.spawned("build-front"), 1);
        assert_eq!(h.executor.spawned("build-back"), 1);

        let lanes: Vec<_> = h.orchestrator.lanes().into_iter().map(|l| l.lane).collect();
        assert_eq!(lanes, vec!["back", "front"]);
    }

    #[tokio::test]
    async fn test_approval_outside_gate() {
        let h = harness(DryRunExecutor::new().fail_job("build-front")).await;
        let err = h
            .orchestrator
            .decide("front", ApprovalDecision::Approved { by: None })
            .unwrap_err();
        assert!(matches!(err, ApprovalError::UnknownLane(_)));

        let start = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "abc1234"))
            .unwrap();
        start.run.await.unwrap();

        let err = h
            .orchestrator
            .decide("front", ApprovalDecision::Approved { by: None })
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotAwaiting { .. }));
        assert!(matches!(Error::from(err), Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_second_rollout_patches_image() {
        let h = harness(DryRunExecutor::new()).await;

        for commit in ["abc1234", "def5678"] {
            let start = h
                .orchestrator
                .start_lane("front", CommitEvent::new("repo-front", commit))
                .unwrap();
            start.handle.wait_for(settled).await;
            start.handle.approve(None).unwrap();
            assert_eq!(start.run.await.unwrap().state, LaneState::Done);
        }

        let operations = h.cluster.operations();
        assert!(matches!(operations[0], ClusterOperation::ApplyManifest(_)));
        match &operations[1] {
            ClusterOperation::SetImage {
                deployment, image, ..
            } => {
                assert_eq!(deployment, "rolling-front");
                assert!(image.ends_with(":def5678"));
            }
            other => panic!("unexpected operation: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lane_runs_one_commit_at_a_time() {
        let h = harness(DryRunExecutor::new()).await;
        let start = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "abc1234"))
            .unwrap();
        start.handle.wait_for(settled).await;

        let err = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "def5678"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(h.orchestrator.lane("front").unwrap().commit().commit, "abc1234");
    }

    #[tokio::test]
    async fn test_start_rejects_unwatched_repository() {
        let h = harness(DryRunExecutor::new()).await;
        let err = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-back", "abc"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = h
            .orchestrator
            .start_lane("missing", CommitEvent::new("repo-front", "abc"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_malformed_commit() {
        let h = harness(DryRunExecutor::new()).await;
        let err = h
            .orchestrator
            .start_lane("front", CommitEvent::new("repo-front", "abc; touch /tmp/x"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(h.orchestrator.lane("front").is_none());
        assert_eq!(h.executor.spawned("build-front"), 0);
    }

    #[tokio::test]
    async fn test_start_watching_starts_matching_lanes() {
        let h = harness(DryRunExecutor::new()).await;
        let started = h
            .orchestrator
            .start_watching(&CommitEvent::new("repo-back", "abc1234"));

        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, "back");
        assert!(started[0].1.is_ok());
        let handle = h.orchestrator.lane("back").unwrap();
        assert!(handle.wait_for(settled).await.is_awaiting_approval());
    }
}
