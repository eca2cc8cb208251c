//! Build job runner: runs a build job for a commit through the build executor.

use futures::StreamExt;
use greenlight_config::{LaneContext, Topology, VariableContext, VariableContextBuilder};
use greenlight_core::buildspec::{BuildPhase, BuildSpec};
use greenlight_core::executor::{
    ArtifactRef, BuildExecutor, BuildInvocation, JobHandle, JobResult, JobStatus, LogLine,
    SourceCheckout,
};
use greenlight_core::pipeline::CommitEvent;
use greenlight_core::resource::BuildJobSpec;
use greenlight_core::{Error, InputValue, OutputRef, Result, RunId};
use greenlight_provisioner::ProvisionReport;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, mpsc};
use tracing::{error, info, warn};

/// Env var carrying the commit the build runs for.
pub const TAG_VAR: &str = "TAG";

const WORKSPACE_DIR: &str = "/workspace";
const LOG_DRAIN: Duration = Duration::from_secs(2);
const DEFAULT_HISTORY: usize = 256;

/// A finished, successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRecord {
    pub id: RunId,
    pub job: String,
    pub commit: String,
    /// Image pushed to the job's promotion registry, if it has one.
    pub artifact: Option<ArtifactRef>,
}

type BuildKey = (String, String);
type Outcome = std::result::Result<BuildRecord, String>;
type BuildCell = Arc<OnceCell<Outcome>>;

/// Builds keyed by (job, commit), oldest first.
#[derive(Default)]
struct BuildHistory {
    cells: HashMap<BuildKey, BuildCell>,
    order: VecDeque<BuildKey>,
}

impl BuildHistory {
    fn cell(&mut self, key: &BuildKey, limit: usize) -> BuildCell {
        if let Some(cell) = self.cells.get(key) {
            return cell.clone();
        }
        let cell = BuildCell::default();
        self.cells.insert(key.clone(), cell.clone());
        self.order.push_back(key.clone());
        self.prune(limit);
        cell
    }

    /// Drop the oldest finished builds until at most `limit` remain.
    /// Builds still running are kept.
    fn prune(&mut self, limit: usize) {
        let mut excess = self.cells.len().saturating_sub(limit);
        let cells = &mut self.cells;
        self.order.retain(|key| {
            let Some(cell) = cells.get(key) else {
                return false;
            };
            if excess > 0 && cell.initialized() {
                cells.remove(key);
                excess -= 1;
                return false;
            }
            true
        });
    }

    /// Forget `key` if it still maps to `cell`.
    fn evict(&mut self, key: &BuildKey, cell: &BuildCell) {
        if self.cells.get(key).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            self.cells.remove(key);
            self.order.retain(|k| k != key);
        }
    }
}

/// Runs build jobs against the outputs of a provisioning run.
///
/// A successful (job, commit) build executes once. Later requests for the
/// same pair, including ones arriving while the build is still running,
/// receive the recorded record. A failed build is forgotten once its
/// waiters have the error, so the next request runs it again.
pub struct BuildJobRunner {
    executor: Arc<dyn BuildExecutor>,
    topology: Arc<Topology>,
    report: Arc<ProvisionReport>,
    builds: Mutex<BuildHistory>,
    /// Finished builds remembered for deduplication.
    history: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BuildJobRunner {
    pub fn new(
        executor: Arc<dyn BuildExecutor>,
        topology: Arc<Topology>,
        report: Arc<ProvisionReport>,
    ) -> Self {
        Self {
            executor,
            topology,
            report,
            builds: Mutex::new(BuildHistory::default()),
            history: DEFAULT_HISTORY,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn report(&self) -> &Arc<ProvisionReport> {
        &self.report
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    /// Image a job publishes for `commit`: `<registry uri>:<commit>`.
    pub fn artifact_for(&self, job: &str, commit: &str) -> Option<ArtifactRef> {
        let promotion = self.topology.build_job(job)?.promotion.as_ref()?;
        let uri = self
            .report
            .output(&OutputRef::new(&promotion.registry, "uri"))?;
        Some(ArtifactRef {
            repository: uri.to_string(),
            tag: commit.to_string(),
        })
    }

    /// Run `job` for the commit. Log lines go to `logs` when this call is
    /// the one that executes the build.
    pub async fn run(
        &self,
        job: &str,
        event: &CommitEvent,
        lane: &LaneContext,
        logs: Option<mpsc::Sender<LogLine>>,
    ) -> Result<BuildRecord> {
        let key = (job.to_string(), event.commit.clone());
        let cell = lock(&self.builds).cell(&key, self.history);

        if cell.initialized() {
            info!(job = %job, commit = %event.short_commit(), "Build already ran for commit");
        }

        let outcome = cell
            .get_or_init(|| async move {
                self.execute(job, event, lane, logs).await.map_err(|e| match e {
                    Error::BuildExecution { message, .. } => message,
                    other => other.to_string(),
                })
            })
            .await;

        if outcome.is_err() {
            lock(&self.builds).evict(&key, &cell);
        }

        outcome.clone().map_err(|message| Error::BuildExecution {
            job: job.to_string(),
            message,
        })
    }

    async fn execute(
        &self,
        job_name: &str,
        event: &CommitEvent,
        lane: &LaneContext,
        logs: Option<mpsc::Sender<LogLine>>,
    ) -> Result<BuildRecord> {
        let build_error = |message: String| Error::BuildExecution {
            job: job_name.to_string(),
            message,
        };

        let job = self
            .topology
            .build_job(job_name)
            .ok_or_else(|| Error::NotFound(format!("build job {}", job_name)))?;
        if !self.report.is_ready(job_name) {
            return Err(build_error("build job is not provisioned".to_string()));
        }
        event.validate()?;

        let ctx = self.variables(event, lane);
        let env = self.resolve_env(job_name, job, event, &ctx)?;
        let phases = job
            .phases
            .iter()
            .map(|p| BuildPhase::new(p.name, ctx.interpolate_vec(&p.commands)))
            .collect();
        let spec = BuildSpec::new(phases, env)?;

        let source = self
            .report
            .output(&OutputRef::new(&job.source, "clone_url_http"))
            .map(|url| SourceCheckout {
                clone_url: url.to_string(),
                commit: event.commit.clone(),
                target_dir: WORKSPACE_DIR.to_string(),
            });

        let invocation = BuildInvocation {
            id: RunId::new(),
            job: job_name.to_string(),
            image: ctx.interpolate(&job.image),
            privileged: job.privileged,
            spec,
            source,
        };
        let id = invocation.id;

        info!(
            job = %job_name,
            commit = %event.short_commit(),
            executor = self.executor.name(),
            run_id = %id,
            "Starting build"
        );
        let handle = self.executor.spawn(invocation).await?;

        let finished = self.follow(&handle, logs).await;
        match &finished {
            Ok(_) => {
                if let Err(e) = self.executor.cleanup(&handle).await {
                    warn!(job = %job_name, run_id = %id, error = %e, "Failed to clean up build");
                }
            }
            Err(e) => {
                warn!(job = %job_name, run_id = %id, error = %e, "Lost track of build, cancelling");
                if let Err(e) = self.executor.cancel(&handle).await {
                    warn!(job = %job_name, run_id = %id, error = %e, "Failed to cancel build");
                }
            }
        }
        let result = finished?;

        match result.status {
            JobStatus::Succeeded { .. } => {
                info!(job = %job_name, commit = %event.short_commit(), "Build succeeded");
                Ok(BuildRecord {
                    id,
                    job: job_name.to_string(),
                    commit: event.commit.clone(),
                    artifact: self.artifact_for(job_name, &event.commit),
                })
            }
            JobStatus::Failed { message, .. } => {
                error!(job = %job_name, exit_code = ?result.exit_code, "Build failed");
                Err(build_error(message))
            }
            JobStatus::Cancelled { .. } => Err(build_error("build was cancelled".to_string())),
            _ => Err(build_error("build ended in unexpected state".to_string())),
        }
    }

    /// Forward logs and wait for the build to finish.
    async fn follow(
        &self,
        handle: &JobHandle,
        logs: Option<mpsc::Sender<LogLine>>,
    ) -> Result<JobResult> {
        let log_task = match logs {
            Some(tx) => {
                let mut stream = self.executor.logs(handle).await?;
                Some(tokio::spawn(async move {
                    while let Some(line) = stream.next().await {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                }))
            }
            None => None,
        };

        let result = self.executor.wait(handle).await;

        // Followed streams may outlive the job; give them a moment to flush.
        if let Some(mut task) = log_task {
            if tokio::time::timeout(LOG_DRAIN, &mut task).await.is_err() {
                task.abort();
            }
        }

        result
    }

    fn variables(&self, event: &CommitEvent, lane: &LaneContext) -> VariableContext {
        let mut builder = VariableContextBuilder::new()
            .stack(&self.topology.stack)
            .commit(event)
            .lane(&lane.name, &lane.stage)
            .with_process_env();
        for (resource, outputs) in self.report.all_outputs() {
            builder = builder.outputs(&resource, outputs);
        }
        builder.build()
    }

    /// Build env: `TAG` first, then the job's declared variables, which may
    /// override it.
    fn resolve_env(
        &self,
        job_name: &str,
        job: &BuildJobSpec,
        event: &CommitEvent,
        ctx: &VariableContext,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert(TAG_VAR.to_string(), event.commit.clone());

        for (key, value) in &job.env {
            let resolved = match value {
                InputValue::Literal(literal) => ctx.interpolate(literal),
                InputValue::Ref(r) => self
                    .report
                    .output(r)
                    .map(str::to_string)
                    .ok_or_else(|| Error::BuildExecution {
                        job: job_name.to_string(),
                        message: format!("env {} references unresolved output {}", key, r),
                    })?,
            };
            env.insert(key.clone(), resolved);
        }

        Ok(env)
    }
}
