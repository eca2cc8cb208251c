//! Dry-run executor: records each invocation and reports an outcome without
//! running anything.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use greenlight_core::executor::*;
use greenlight_core::{Error, Result, RunId};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

struct Recorded {
    invocation: BuildInvocation,
    status: JobStatus,
    cancelled: bool,
    cleaned_up: bool,
}

#[derive(Default)]
pub struct DryRunExecutor {
    runs: Mutex<HashMap<RunId, Recorded>>,
    order: Mutex<Vec<RunId>>,
    failing_jobs: HashSet<String>,
    lost_jobs: HashSet<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build of `job` fails with exit code 1.
    pub fn fail_job(mut self, job: impl Into<String>) -> Self {
        self.failing_jobs.insert(job.into());
        self
    }

    /// Waiting on a build of `job` fails, as when the executor loses the job.
    pub fn lose_job(mut self, job: impl Into<String>) -> Self {
        self.lost_jobs.insert(job.into());
        self
    }

    /// Invocations received so far, in spawn order.
    pub fn invocations(&self) -> Vec<BuildInvocation> {
        let runs = lock(&self.runs);
        lock(&self.order)
            .iter()
            .filter_map(|id| runs.get(id).map(|r| r.invocation.clone()))
            .collect()
    }

    /// Number of builds spawned for `job`.
    pub fn spawned(&self, job: &str) -> usize {
        lock(&self.runs)
            .values()
            .filter(|r| r.invocation.job == job)
            .count()
    }

    /// Number of builds of `job` that were cancelled.
    pub fn cancelled(&self, job: &str) -> usize {
        self.count(job, |r| r.cancelled)
    }

    /// Number of builds of `job` that were cleaned up after finishing.
    pub fn cleaned_up(&self, job: &str) -> usize {
        self.count(job, |r| r.cleaned_up)
    }

    fn count(&self, job: &str, f: impl Fn(&Recorded) -> bool) -> usize {
        lock(&self.runs)
            .values()
            .filter(|r| r.invocation.job == job && f(r))
            .count()
    }

    fn with_run<T>(&self, handle: &JobHandle, f: impl FnOnce(&mut Recorded) -> T) -> Result<T> {
        let mut runs = lock(&self.runs);
        let run = runs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("build {}", handle.id)))?;
        Ok(f(run))
    }
}

#[async_trait]
impl BuildExecutor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn spawn(&self, invocation: BuildInvocation) -> Result<JobHandle> {
        let now = Utc::now();
        let status = if self.failing_jobs.contains(&invocation.job) {
            JobStatus::Failed {
                started_at: Some(now),
                finished_at: now,
                exit_code: Some(1),
                message: "dry-run failure".to_string(),
            }
        } else {
            JobStatus::Succeeded {
                started_at: now,
                finished_at: now,
            }
        };

        info!(job = %invocation.job, id = %invocation.id, "Recording dry-run build");
        let handle = JobHandle {
            id: invocation.id,
            executor_id: invocation.id.to_string(),
            executor_name: self.name().to_string(),
        };
        lock(&self.order).push(invocation.id);
        lock(&self.runs).insert(
            invocation.id,
            Recorded {
                invocation,
                status,
                cancelled: false,
                cleaned_up: false,
            },
        );
        Ok(handle)
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let lines: Vec<LogLine> = self.with_run(handle, |run| {
            let mut lines = Vec::new();
            let mut push = |stream: LogStream, content: String| {
                lines.push(LogLine {
                    timestamp: Utc::now(),
                    stream,
                    content,
                });
            };
            for phase in run.invocation.spec.phases() {
                push(LogStream::System, format!("[phase] {}", phase.name));
                for command in &phase.commands {
                    push(LogStream::Stdout, format!("$ {}", command));
                }
            }
            lines
        })?;
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.with_run(handle, |run| run.status.clone())
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let lost = self.with_run(handle, |run| self.lost_jobs.contains(&run.invocation.job))?;
        if lost {
            return Err(Error::Internal(format!("lost track of build {}", handle.id)));
        }
        self.with_run(handle, |run| {
            let exit_code = match &run.status {
                JobStatus::Succeeded { .. } => Some(0),
                JobStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            JobResult {
                status: run.status.clone(),
                exit_code,
            }
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.with_run(handle, |run| {
            run.cancelled = true;
            if !run.status.is_terminal() {
                run.status = JobStatus::Cancelled {
                    started_at: None,
                    cancelled_at: Utc::now(),
                };
            }
        })
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        self.with_run(handle, |run| run.cleaned_up = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use greenlight_core::buildspec::{BuildPhase, BuildSpec, PhaseName};
    use std::collections::BTreeMap;

    fn invocation(job: &str) -> BuildInvocation {
        let spec = BuildSpec::new(
            vec![
                BuildPhase::new(PhaseName::PreBuild, vec!["env".to_string()]),
                BuildPhase::new(PhaseName::Build, vec!["make".to_string()]),
            ],
            BTreeMap::new(),
        )
        .unwrap();
        BuildInvocation {
            id: RunId::new(),
            job: job.to_string(),
            image: "builder".to_string(),
            privileged: false,
            spec,
            source: None,
        }
    }

    #[tokio::test]
    async fn test_records_and_succeeds() {
        let executor = DryRunExecutor::new();
        let handle = executor.spawn(invocation("build-front")).await.unwrap();

        let result = executor.wait(&handle).await.unwrap();
        assert!(result.status.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(executor.spawned("build-front"), 1);
        assert_eq!(executor.invocations()[0].job, "build-front");
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let executor = DryRunExecutor::new().fail_job("build-back");
        let handle = executor.spawn(invocation("build-back")).await.unwrap();

        let result = executor.wait(&handle).await.unwrap();
        assert!(matches!(result.status, JobStatus::Failed { .. }));
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_lost_job_fails_wait() {
        let executor = DryRunExecutor::new().lose_job("build-front");
        let handle = executor.spawn(invocation("build-front")).await.unwrap();

        assert!(matches!(executor.wait(&handle).await, Err(Error::Internal(_))));
        executor.cancel(&handle).await.unwrap();
        assert_eq!(executor.cancelled("build-front"), 1);
        assert_eq!(executor.cleaned_up("build-front"), 0);
    }

    #[tokio::test]
    async fn test_logs_follow_phases() {
        let executor = DryRunExecutor::new();
        let handle = executor.spawn(invocation("build-front")).await.unwrap();

        let lines: Vec<String> = executor
            .logs(&handle)
            .await
            .unwrap()
            .map(|l| l.content)
            .collect()
            .await;
        assert_eq!(
            lines,
            vec!["[phase] pre_build", "$ env", "[phase] build", "$ make"]
        );
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let executor = DryRunExecutor::new();
        let handle = JobHandle {
            id: RunId::new(),
            executor_id: "x".to_string(),
            executor_name: "dry-run".to_string(),
        };
        assert!(matches!(
            executor.status(&handle).await,
            Err(Error::NotFound(_))
        ));
    }
}
