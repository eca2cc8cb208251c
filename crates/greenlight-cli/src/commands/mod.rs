//! CLI command implementations.

pub mod lanes;
pub mod run;
pub mod serve;
pub mod stack;

use anyhow::{Context, Result};
use greenlight_config::{ClusterBackend, ExecutorBackend, RuntimeSettings, Topology};
use greenlight_core::executor::BuildExecutor;
use greenlight_deployer::{KubernetesTarget, MemoryCluster, Promoter};
use greenlight_executor::{DryRunExecutor, LocalDockerExecutor};
use greenlight_provisioner::{
    GraphBuilder, ProvisionEvent, ProvisionReport, Provisioner, SimulatedProvider, StateFile,
};
use greenlight_scheduler::{BuildJobRunner, PipelineOrchestrator, TriggerBinder};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a lane needs, provisioned and bound.
pub struct Runtime {
    pub topology: Arc<Topology>,
    pub report: Arc<ProvisionReport>,
    pub triggers: TriggerBinder,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

pub fn load_topology(path: &str) -> Result<Topology> {
    Topology::load(path).with_context(|| format!("Failed to load topology: {}", path))
}

/// Provision the stack, adopting what the state file already records, and
/// write the new state back.
pub async fn provision(topology: &Topology, settings: &RuntimeSettings) -> Result<ProvisionReport> {
    let plan = GraphBuilder::from_topology(topology)?.build()?;

    let previous = StateFile::load(&settings.state_path)
        .await
        .with_context(|| format!("Failed to read state: {}", settings.state_path.display()))?
        .unwrap_or_default();
    let provider = SimulatedProvider::new().with_records(previous.records());
    let provisioner = Provisioner::new(Arc::new(provider)).with_applied_grants(previous.grants);

    let (mut rx, handle) = provisioner.run(plan);
    while let Some(event) = rx.recv().await {
        match event {
            ProvisionEvent::ResourceCreated { name, .. } => println!("+ {}", name),
            ProvisionEvent::ResourceAdopted { name, .. } => println!("= {}", name),
            ProvisionEvent::ResourceUpdated { name, .. } => println!("~ {}", name),
            ProvisionEvent::GrantApplied { grant } => println!("  grant {}", grant),
            ProvisionEvent::ResourceFailed { name, reason } => {
                println!("✗ {}: {}", name, reason)
            }
            ProvisionEvent::ResourceSkipped { name, dependency } => {
                println!("⊘ {} (waiting on {})", name, dependency)
            }
            ProvisionEvent::ResourceStarted { .. } | ProvisionEvent::ProvisionCompleted { .. } => {}
        }
    }
    let report = handle.await.context("Provisioning task failed")?;

    let outputs = report.resolve_outputs(&topology.operator_outputs());
    StateFile::from_report(&topology.stack, &report, outputs)
        .save(&settings.state_path)
        .await
        .with_context(|| format!("Failed to write state: {}", settings.state_path.display()))?;

    if report.is_success() {
        info!(stack = %topology.stack, resources = report.resources.len(), "Stack provisioned");
    } else {
        warn!(stack = %topology.stack, failed = report.failed().count(), "Stack partially provisioned");
    }
    Ok(report)
}

pub fn executor(settings: &RuntimeSettings) -> Result<Arc<dyn BuildExecutor>> {
    Ok(match settings.executor {
        ExecutorBackend::Docker => {
            Arc::new(LocalDockerExecutor::new().context("Failed to connect to Docker")?)
        }
        ExecutorBackend::DryRun => Arc::new(DryRunExecutor::new()),
    })
}

pub async fn promoter(settings: &RuntimeSettings) -> Result<Promoter> {
    Ok(match settings.cluster {
        ClusterBackend::Kubernetes => Promoter::new(Arc::new(
            KubernetesTarget::new(settings.namespace.clone())
                .await
                .context("Failed to connect to Kubernetes")?,
        )),
        ClusterBackend::Memory => Promoter::new(Arc::new(MemoryCluster::new())),
    })
}

/// Provision, bind the declared triggers and set up the orchestrator.
pub async fn runtime(path: &str, settings: &RuntimeSettings) -> Result<Runtime> {
    let topology = Arc::new(load_topology(path)?);
    let report = Arc::new(provision(&topology, settings).await?);

    let runner = Arc::new(BuildJobRunner::new(
        executor(settings)?,
        topology.clone(),
        report.clone(),
    ));
    let triggers = TriggerBinder::new(runner.clone());
    let bound = triggers.bind_declared()?;
    info!(bindings = bound, "Triggers bound");

    let orchestrator = Arc::new(PipelineOrchestrator::new(runner, promoter(settings).await?));

    Ok(Runtime {
        topology,
        report,
        triggers,
        orchestrator,
    })
}
