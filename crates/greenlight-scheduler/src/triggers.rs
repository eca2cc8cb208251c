//! Trigger binder: subscribes build jobs to the commit streams of source
//! repositories.
//!
//! Every repository gets one dispatch task, created on its first commit.
//! The task handles that repository's commits in arrival order; commits of
//! different repositories are dispatched independently.

use crate::runner::{BuildJobRunner, BuildRecord};
use futures::future::join_all;
use greenlight_config::LaneContext;
use greenlight_core::ResourceKind;
use greenlight_core::access::Grant;
use greenlight_core::executor::ArtifactRef;
use greenlight_core::pipeline::{CommitBinding, CommitEvent};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("'{name}' is not a declared {kind}")]
    UnknownResource { name: String, kind: ResourceKind },

    #[error("'{resource}' is not ready: {state}")]
    NotReady { resource: String, state: String },

    #[error("'{job}' is missing grant {grant}")]
    MissingGrant { job: String, grant: Grant },

    #[error("'{job}' builds from '{expected}', not '{repository}'")]
    SourceMismatch {
        job: String,
        expected: String,
        repository: String,
    },

    #[error("dispatcher for '{0}' has stopped")]
    DispatcherStopped(String),
}

impl From<TriggerError> for greenlight_core::Error {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::UnknownResource { .. } => greenlight_core::Error::NotFound(err.to_string()),
            TriggerError::NotReady { .. }
            | TriggerError::MissingGrant { .. }
            | TriggerError::SourceMismatch { .. } => {
                greenlight_core::Error::Conflict(err.to_string())
            }
            TriggerError::DispatcherStopped(_) => greenlight_core::Error::Internal(err.to_string()),
        }
    }
}

/// Event emitted while dispatching commits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    BuildStarted {
        job: String,
        commit: String,
    },
    BuildSucceeded {
        job: String,
        commit: String,
        artifact: Option<ArtifactRef>,
    },
    BuildFailed {
        job: String,
        commit: String,
        message: String,
    },
}

struct Inner {
    runner: Arc<BuildJobRunner>,
    bindings: Mutex<BTreeSet<CommitBinding>>,
    dispatchers: Mutex<HashMap<String, mpsc::UnboundedSender<CommitEvent>>>,
    events: Option<mpsc::Sender<TriggerEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct TriggerBinder {
    inner: Arc<Inner>,
}

impl TriggerBinder {
    pub fn new(runner: Arc<BuildJobRunner>) -> Self {
        Self::build(runner, None)
    }

    /// Binder that reports dispatch progress on the returned channel.
    pub fn with_events(runner: Arc<BuildJobRunner>) -> (Self, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(100);
        (Self::build(runner, Some(tx)), rx)
    }

    fn build(runner: Arc<BuildJobRunner>, events: Option<mpsc::Sender<TriggerEvent>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                bindings: Mutex::new(BTreeSet::new()),
                dispatchers: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Subscribe `binding.job` to commits of `binding.repository`.
    ///
    /// Returns `false` when the pair was already bound. Fails without side
    /// effects when either resource is not ready, the job builds from another
    /// repository, or a grant declared for the job was not applied.
    pub fn bind(&self, binding: CommitBinding) -> Result<bool, TriggerError> {
        self.check(&binding)?;

        let added = lock(&self.inner.bindings).insert(binding.clone());
        if added {
            info!(repository = %binding.repository, job = %binding.job, "Bound build job to commits");
        }
        Ok(added)
    }

    /// Bind every trigger declared in the topology. Stops at the first failure.
    pub fn bind_declared(&self) -> Result<usize, TriggerError> {
        let declared = self.inner.runner.topology().triggers.clone();
        let mut added = 0;
        for binding in declared {
            if self.bind(binding)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn bindings(&self) -> Vec<CommitBinding> {
        lock(&self.inner.bindings).iter().cloned().collect()
    }

    /// Jobs bound to `repository`, in name order.
    pub fn jobs_for(&self, repository: &str) -> Vec<String> {
        lock(&self.inner.bindings)
            .iter()
            .filter(|b| b.repository == repository)
            .map(|b| b.job.clone())
            .collect()
    }

    /// Queue a commit for dispatch. Returns the number of jobs bound to its
    /// repository when it was queued.
    pub fn publish(&self, event: CommitEvent) -> Result<usize, TriggerError> {
        let jobs = self.jobs_for(&event.repository).len();
        if jobs == 0 {
            info!(repository = %event.repository, commit = %event.short_commit(), "No build jobs bound");
            return Ok(0);
        }

        let repository = event.repository.clone();
        let mut dispatchers = lock(&self.inner.dispatchers);
        let sender = dispatchers
            .entry(repository.clone())
            .or_insert_with(|| Self::spawn_dispatcher(self.inner.clone(), repository.clone()));
        sender
            .send(event)
            .map_err(|_| TriggerError::DispatcherStopped(repository))?;
        Ok(jobs)
    }

    fn check(&self, binding: &CommitBinding) -> Result<(), TriggerError> {
        let runner = &self.inner.runner;
        let topology = runner.topology();
        let report = runner.report();

        for (name, kind) in [
            (&binding.repository, ResourceKind::SourceRepo),
            (&binding.job, ResourceKind::BuildJob),
        ] {
            let declared = topology.resource(name).map(|r| r.kind());
            if declared != Some(kind) {
                return Err(TriggerError::UnknownResource {
                    name: name.clone(),
                    kind,
                });
            }
            match report.get(name) {
                Some(r) if r.state.is_ready() => {}
                Some(r) => {
                    return Err(TriggerError::NotReady {
                        resource: name.clone(),
                        state: r.state.to_string(),
                    });
                }
                None => {
                    return Err(TriggerError::NotReady {
                        resource: name.clone(),
                        state: "not provisioned".to_string(),
                    });
                }
            }
        }

        if let Some(job) = topology.build_job(&binding.job) {
            if job.source != binding.repository {
                return Err(TriggerError::SourceMismatch {
                    job: binding.job.clone(),
                    expected: job.source.clone(),
                    repository: binding.repository.clone(),
                });
            }
        }

        if let Some(grant) = topology
            .grants
            .iter()
            .filter(|g| g.principal == binding.job)
            .find(|g| !report.has_grant(g))
        {
            return Err(TriggerError::MissingGrant {
                job: binding.job.clone(),
                grant: grant.clone(),
            });
        }

        Ok(())
    }

    fn spawn_dispatcher(inner: Arc<Inner>, repository: String) -> mpsc::UnboundedSender<CommitEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<CommitEvent>();
        tokio::spawn(async move {
            info!(repository = %repository, "Starting commit dispatcher");
            while let Some(event) = rx.recv().await {
                Self::dispatch(&inner, &event).await;
            }
        });
        tx
    }

    /// Run every job bound to the commit's repository. Jobs of one commit run
    /// concurrently; the next commit waits for all of them.
    async fn dispatch(inner: &Inner, event: &CommitEvent) {
        let jobs: Vec<String> = lock(&inner.bindings)
            .iter()
            .filter(|b| b.repository == event.repository)
            .map(|b| b.job.clone())
            .collect();

        let runs = jobs.iter().map(|job| async move {
            Self::emit(
                inner,
                TriggerEvent::BuildStarted {
                    job: job.clone(),
                    commit: event.commit.clone(),
                },
            )
            .await;

            let lane = LaneContext::default();
            let outcome = inner.runner.run(job, event, &lane, None).await;
            Self::emit(inner, Self::finished(job, event, outcome)).await;
        });
        join_all(runs).await;
    }

    fn finished(
        job: &str,
        event: &CommitEvent,
        outcome: greenlight_core::Result<BuildRecord>,
    ) -> TriggerEvent {
        match outcome {
            Ok(record) => TriggerEvent::BuildSucceeded {
                job: job.to_string(),
                commit: event.commit.clone(),
                artifact: record.artifact,
            },
            Err(e) => {
                warn!(job = %job, commit = %event.short_commit(), error = %e, "Triggered build failed");
                TriggerEvent::BuildFailed {
                    job: job.to_string(),
                    commit: event.commit.clone(),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn emit(inner: &Inner, event: TriggerEvent) {
        if let Some(tx) = &inner.events {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{provisioned, provisioned_with};
    use greenlight_core::access::Capability;
    use greenlight_executor::DryRunExecutor;
    use greenlight_provisioner::SimulatedProvider;

    async fn binder(executor: Arc<DryRunExecutor>) -> (TriggerBinder, mpsc::Receiver<TriggerEvent>) {
        let (topology, report) = provisioned().await;
        TriggerBinder::with_events(Arc::new(BuildJobRunner::new(executor, topology, report)))
    }

    async fn next_finished(rx: &mut mpsc::Receiver<TriggerEvent>) -> TriggerEvent {
        loop {
            match rx.recv().await.unwrap() {
                TriggerEvent::BuildStarted { .. } => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let (binder, _rx) = binder(Arc::new(DryRunExecutor::new())).await;
        let binding = CommitBinding::new("repo-front", "build-front");

        assert!(binder.bind(binding.clone()).unwrap());
        assert!(!binder.bind(binding.clone()).unwrap());
        assert_eq!(binder.bindings(), vec![binding]);
    }

    #[tokio::test]
    async fn test_bind_declared() {
        let (binder, _rx) = binder(Arc::new(DryRunExecutor::new())).await;
        assert_eq!(binder.bind_declared().unwrap(), 2);
        assert_eq!(binder.bind_declared().unwrap(), 0);
        assert_eq!(binder.jobs_for("repo-back"), vec!["build-back"]);
    }

    #[tokio::test]
    async fn test_bind_rejects_wrong_kinds_and_sources() {
        let (binder, _rx) = binder(Arc::new(DryRunExecutor::new())).await;

        let err = binder
            .bind(CommitBinding::new("ecr-front", "build-front"))
            .unwrap_err();
        assert!(matches!(err, TriggerError::UnknownResource { .. }));

        let err = binder
            .bind(CommitBinding::new("repo-back", "build-front"))
            .unwrap_err();
        assert!(matches!(err, TriggerError::SourceMismatch { .. }));
        assert!(binder.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_bind_fails_when_grant_missing() {
        let provider = SimulatedProvider::new().fail_grants_for("build-front");
        let (topology, report) = provisioned_with(provider).await;
        let binder = TriggerBinder::new(Arc::new(BuildJobRunner::new(
            Arc::new(DryRunExecutor::new()),
            topology,
            report,
        )));

        // The failed grant leaves the job itself failed.
        let err = binder
            .bind(CommitBinding::new("repo-front", "build-front"))
            .unwrap_err();
        assert!(matches!(err, TriggerError::NotReady { .. }));

        assert!(binder.bind(CommitBinding::new("repo-back", "build-back")).unwrap());
    }

    #[test]
    fn test_missing_grant_message() {
        let err = TriggerError::MissingGrant {
            job: "build-front".to_string(),
            grant: Grant::new("build-front", "ecr-front", Capability::PullPush),
        };
        assert!(err.to_string().contains("ecr-front"));
        assert!(matches!(
            greenlight_core::Error::from(err),
            greenlight_core::Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_bindings() {
        let executor = Arc::new(DryRunExecutor::new());
        let (binder, _rx) = binder(executor.clone()).await;
        assert_eq!(binder.publish(CommitEvent::new("repo-front", "abc")).unwrap(), 0);
        assert!(executor.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_commits_dispatch_in_order_per_repository() {
        let executor = Arc::new(DryRunExecutor::new());
        let (binder, mut rx) = binder(executor.clone()).await;
        binder.bind_declared().unwrap();

        binder.publish(CommitEvent::new("repo-front", "c1")).unwrap();
        binder.publish(CommitEvent::new("repo-front", "c2")).unwrap();
        binder.publish(CommitEvent::new("repo-front", "c1")).unwrap();

        let mut commits = Vec::new();
        for _ in 0..3 {
            match next_finished(&mut rx).await {
                TriggerEvent::BuildSucceeded { commit, artifact, .. } => {
                    assert_eq!(artifact.unwrap().tag, commit);
                    commits.push(commit);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(commits, vec!["c1", "c2", "c1"]);

        // The redelivered commit reuses the first build.
        let built: Vec<_> = executor
            .invocations()
            .into_iter()
            .map(|i| i.source.unwrap().commit)
            .collect();
        assert_eq!(built, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_failed_build_is_reported() {
        let executor = Arc::new(DryRunExecutor::new().fail_job("build-back"));
        let (binder, mut rx) = binder(executor).await;
        binder.bind_declared().unwrap();

        binder.publish(CommitEvent::new("repo-back", "abc")).unwrap();
        match next_finished(&mut rx).await {
            TriggerEvent::BuildFailed { job, message, .. } => {
                assert_eq!(job, "build-back");
                assert!(message.contains("dry-run failure"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
