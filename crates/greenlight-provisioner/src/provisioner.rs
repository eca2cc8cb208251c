//! Provisioner - materializes a plan's resources in order, exactly once.

use crate::access::{AccessBinder, GrantError};
use crate::graph::ProvisionPlan;
use greenlight_config::StackOutput;
use greenlight_core::access::Grant;
use greenlight_core::provider::{CreateRequest, Provider};
use greenlight_core::{
    Error, InputValue, OutputRef, Outputs, ProvisioningState, Resource, ResourceKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event emitted while a plan is provisioned.
#[derive(Debug, Clone)]
pub enum ProvisionEvent {
    ResourceStarted { name: String, kind: ResourceKind },
    /// The provider created the resource.
    ResourceCreated { name: String, outputs: Outputs },
    /// The provider already knew the resource with the same inputs.
    ResourceAdopted { name: String, outputs: Outputs },
    /// The provider knew the resource with different inputs.
    ResourceUpdated { name: String, outputs: Outputs },
    GrantApplied { grant: Grant },
    ResourceFailed { name: String, reason: String },
    /// Not attempted because a dependency is not ready.
    ResourceSkipped { name: String, dependency: String },
    ProvisionCompleted { ready: usize, failed: usize },
}

/// Final state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub name: String,
    pub kind: ResourceKind,
    pub state: ProvisioningState,
    /// Inputs as handed to the provider.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Outputs,
}

impl ProvisionedResource {
    fn pending(resource: &Resource) -> Self {
        Self {
            name: resource.name.clone(),
            kind: resource.kind(),
            state: ProvisioningState::Pending,
            inputs: BTreeMap::new(),
            outputs: Outputs::new(),
        }
    }
}

/// An operator output with its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOutput {
    pub name: String,
    pub value: String,
}

/// Result of provisioning a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionReport {
    /// Resources in provisioning order.
    pub resources: Vec<ProvisionedResource>,
    /// Every grant in place after the run, including earlier ones.
    pub grants: Vec<Grant>,
}

impl ProvisionReport {
    pub fn get(&self, name: &str) -> Option<&ProvisionedResource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.get(name).is_some_and(|r| r.state.is_ready())
    }

    /// Outputs of a ready resource.
    pub fn outputs(&self, name: &str) -> Option<&Outputs> {
        self.get(name)
            .filter(|r| r.state.is_ready())
            .map(|r| &r.outputs)
    }

    pub fn output(&self, r: &OutputRef) -> Option<&str> {
        self.outputs(&r.resource)
            .and_then(|outputs| outputs.get(&r.key))
            .map(String::as_str)
    }

    /// Outputs of every ready resource, by name.
    pub fn all_outputs(&self) -> BTreeMap<String, Outputs> {
        self.resources
            .iter()
            .filter(|r| r.state.is_ready())
            .map(|r| (r.name.clone(), r.outputs.clone()))
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ProvisionedResource> {
        self.resources
            .iter()
            .filter(|r| matches!(r.state, ProvisioningState::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.resources.iter().all(|r| r.state.is_ready())
    }

    pub fn has_grant(&self, grant: &Grant) -> bool {
        self.grants.contains(grant)
    }

    /// Values of the requested outputs. Outputs of resources that are not
    /// ready are left out.
    pub fn resolve_outputs(&self, wanted: &[StackOutput]) -> Vec<ResolvedOutput> {
        wanted
            .iter()
            .filter_map(|o| {
                self.output(&o.from).map(|value| ResolvedOutput {
                    name: o.name.clone(),
                    value: value.to_string(),
                })
            })
            .collect()
    }
}

/// Walks a plan through a provider.
pub struct Provisioner {
    provider: Arc<dyn Provider>,
    applied_grants: Vec<Grant>,
}

impl Provisioner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            applied_grants: Vec::new(),
        }
    }

    /// Grants known to be in place from an earlier run; they are not re-applied.
    pub fn with_applied_grants(mut self, grants: impl IntoIterator<Item = Grant>) -> Self {
        self.applied_grants.extend(grants);
        self
    }

    /// Provision a plan, returning a channel of events and a handle to get the report.
    pub fn run(
        &self,
        plan: ProvisionPlan,
    ) -> (
        mpsc::Receiver<ProvisionEvent>,
        tokio::task::JoinHandle<ProvisionReport>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let provider = self.provider.clone();
        let access = AccessBinder::with_applied(self.applied_grants.clone());

        let handle =
            tokio::spawn(async move { Self::run_inner(provider, access, plan, tx).await });

        (rx, handle)
    }

    /// Provision a plan without observing events.
    pub async fn provision(&self, plan: ProvisionPlan) -> ProvisionReport {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let access = AccessBinder::with_applied(self.applied_grants.clone());
        Self::run_inner(self.provider.clone(), access, plan, tx).await
    }

    async fn run_inner(
        provider: Arc<dyn Provider>,
        mut access: AccessBinder,
        plan: ProvisionPlan,
        tx: mpsc::Sender<ProvisionEvent>,
    ) -> ProvisionReport {
        let mut results: Vec<ProvisionedResource> = plan
            .resources()
            .iter()
            .map(ProvisionedResource::pending)
            .collect();
        let index: HashMap<String, usize> = results
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();

        for (i, resource) in plan.resources().iter().enumerate() {
            let name = resource.name.as_str();

            // Fail closed: anything downstream of a failure is never attempted.
            let blocked = plan
                .dependencies_of(name)
                .map(|e| e.provider.as_str())
                .find(|p| !index.get(*p).is_some_and(|&j| results[j].state.is_ready()));
            if let Some(dependency) = blocked {
                warn!(resource = %name, dependency = %dependency, "Skipping resource, dependency not ready");
                results[i].state = ProvisioningState::Failed {
                    reason: format!("dependency '{}' is not ready", dependency),
                };
                let _ = tx
                    .send(ProvisionEvent::ResourceSkipped {
                        name: name.to_string(),
                        dependency: dependency.to_string(),
                    })
                    .await;
                continue;
            }

            let lookup = |r: &OutputRef| -> Option<String> {
                index
                    .get(&r.resource)
                    .and_then(|&j| results[j].outputs.get(&r.key))
                    .cloned()
            };

            let missing = plan
                .dependencies_of(name)
                .find(|e| lookup(&OutputRef::new(&e.provider, &e.key)).is_none())
                .map(|e| format!("'{}' has no output '{}'", e.provider, e.key));

            let inputs: BTreeMap<String, String> = resource
                .inputs
                .iter()
                .filter_map(|(key, value)| {
                    let resolved = match value {
                        InputValue::Literal(s) => Some(s.clone()),
                        InputValue::Ref(r) => lookup(r),
                    };
                    resolved.map(|v| (key.clone(), v))
                })
                .collect();

            if let Some(reason) = missing {
                error!(resource = %name, reason = %reason, "Unresolvable input");
                results[i].state = ProvisioningState::Failed {
                    reason: reason.clone(),
                };
                let _ = tx
                    .send(ProvisionEvent::ResourceFailed {
                        name: name.to_string(),
                        reason,
                    })
                    .await;
                continue;
            }

            results[i].state = ProvisioningState::Provisioning;
            results[i].inputs = inputs.clone();
            let _ = tx
                .send(ProvisionEvent::ResourceStarted {
                    name: name.to_string(),
                    kind: resource.kind(),
                })
                .await;

            let event = match Self::materialize(provider.as_ref(), resource, &inputs).await {
                Ok(event) => event,
                Err(e) => {
                    error!(resource = %name, error = %e, "Provisioning failed");
                    results[i].state = ProvisioningState::Failed {
                        reason: e.to_string(),
                    };
                    let _ = tx
                        .send(ProvisionEvent::ResourceFailed {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })
                        .await;
                    continue;
                }
            };

            let outputs = match &event {
                ProvisionEvent::ResourceCreated { outputs, .. }
                | ProvisionEvent::ResourceAdopted { outputs, .. }
                | ProvisionEvent::ResourceUpdated { outputs, .. } => outputs.clone(),
                _ => Outputs::new(),
            };
            results[i].outputs = outputs;
            let _ = tx.send(event).await;

            // Grants complete before the principal counts as ready, so no
            // consumer, trigger or lane sees it without its permissions.
            let mut grant_failure = None;
            for grant in plan.grants_for(name) {
                let Some(target) = index.get(&grant.resource).map(|&j| &results[j]) else {
                    grant_failure = Some(GrantError::NotReady {
                        grant: grant.clone(),
                        resource: grant.resource.clone(),
                    });
                    break;
                };
                if !target.state.is_ready() {
                    grant_failure = Some(GrantError::NotReady {
                        grant: grant.clone(),
                        resource: grant.resource.clone(),
                    });
                    break;
                }

                match access
                    .grant(
                        provider.as_ref(),
                        grant,
                        &results[i].outputs,
                        &target.outputs,
                    )
                    .await
                {
                    Ok(true) => {
                        let _ = tx
                            .send(ProvisionEvent::GrantApplied {
                                grant: grant.clone(),
                            })
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        grant_failure = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = grant_failure {
                let err = Error::from(e);
                error!(resource = %name, error = %err, "Grant failed");
                results[i].state = ProvisioningState::Failed {
                    reason: err.to_string(),
                };
                let _ = tx
                    .send(ProvisionEvent::ResourceFailed {
                        name: name.to_string(),
                        reason: err.to_string(),
                    })
                    .await;
                continue;
            }

            info!(resource = %name, "Resource ready");
            results[i].state = ProvisioningState::Ready;
        }

        let ready = results.iter().filter(|r| r.state.is_ready()).count();
        let failed = results.len() - ready;
        info!(ready, failed, "Provisioning completed");
        let _ = tx
            .send(ProvisionEvent::ProvisionCompleted { ready, failed })
            .await;

        ProvisionReport {
            resources: results,
            grants: access.into_applied(),
        }
    }

    /// Describe, then adopt, update or create.
    async fn materialize(
        provider: &dyn Provider,
        resource: &Resource,
        inputs: &BTreeMap<String, String>,
    ) -> greenlight_core::Result<ProvisionEvent> {
        let name = resource.name.clone();
        let request = CreateRequest {
            name: &resource.name,
            spec: &resource.spec,
            inputs,
        };

        match provider.describe(&resource.name, resource.kind()).await? {
            Some(record) if record.inputs == *inputs => {
                info!(resource = %name, "Adopting existing resource");
                Ok(ProvisionEvent::ResourceAdopted {
                    name,
                    outputs: record.outputs,
                })
            }
            Some(_) => {
                info!(resource = %name, "Updating resource with changed inputs");
                let outputs = provider.update(&request).await?;
                Ok(ProvisionEvent::ResourceUpdated { name, outputs })
            }
            None => {
                info!(resource = %name, kind = %resource.kind(), "Creating resource");
                let outputs = provider.create(&request).await?;
                Ok(ProvisionEvent::ResourceCreated { name, outputs })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::simulated::{ProviderCall, SimulatedProvider};
    use greenlight_core::access::Capability;
    use greenlight_core::resource::{
        ClusterSpec, NetworkSpec, RegistrySpec, ResourceSpec, SourceRepoSpec,
    };

    fn network() -> Resource {
        Resource::new(
            "vpc",
            ResourceSpec::Network(NetworkSpec {
                cidr: "10.0.0.0/16".to_string(),
                nat_gateways: 1,
            }),
        )
    }

    fn cluster() -> Resource {
        Resource::new(
            "cluster",
            ResourceSpec::ComputeCluster(ClusterSpec {
                version: "1.21".to_string(),
                default_capacity: 2,
                masters_role: None,
                ingress_port: 80,
            }),
        )
        .with_input("vpc_id", InputValue::Ref(OutputRef::new("vpc", "id")))
    }

    fn registry(name: &str) -> Resource {
        Resource::new(name, ResourceSpec::Registry(RegistrySpec::default()))
    }

    fn repo(name: &str) -> Resource {
        Resource::new(
            name,
            ResourceSpec::SourceRepo(SourceRepoSpec {
                repository_name: name.to_string(),
            }),
        )
    }

    fn plan(resources: Vec<Resource>, grants: Vec<Grant>) -> ProvisionPlan {
        let mut builder = GraphBuilder::new();
        for r in resources {
            builder.declare(r).unwrap();
        }
        for g in grants {
            builder.declare_grant(g);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_provisions_in_order_and_resolves_inputs() {
        let provider = Arc::new(SimulatedProvider::new());
        let provisioner = Provisioner::new(provider.clone());

        let report = provisioner
            .provision(plan(vec![cluster(), network(), registry("ecr")], vec![]))
            .await;

        assert!(report.is_success());
        assert_eq!(provider.created(), vec!["vpc", "cluster", "ecr"]);
        assert_eq!(
            report.get("cluster").unwrap().inputs.get("vpc_id").map(String::as_str),
            Some("vpc-vpc")
        );
    }

    #[tokio::test]
    async fn test_events_stream() {
        let provider = Arc::new(SimulatedProvider::new());
        let provisioner = Provisioner::new(provider);

        let (mut rx, handle) = provisioner.run(plan(vec![network(), cluster()], vec![]));
        let mut created = Vec::new();
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                ProvisionEvent::ResourceCreated { name, outputs } => {
                    assert!(!outputs.is_empty());
                    created.push(name);
                }
                ProvisionEvent::ProvisionCompleted { ready, failed } => {
                    assert_eq!((ready, failed), (2, 0));
                    completed = true;
                }
                _ => {}
            }
        }
        let report = handle.await.unwrap();

        assert_eq!(created, vec!["vpc", "cluster"]);
        assert!(completed);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_failure_isolated_to_dependents() {
        let provider = Arc::new(SimulatedProvider::new().fail_create("vpc"));
        let provisioner = Provisioner::new(provider.clone());

        let report = provisioner
            .provision(plan(vec![network(), cluster(), registry("ecr")], vec![]))
            .await;

        assert!(matches!(
            report.get("vpc").unwrap().state,
            ProvisioningState::Failed { .. }
        ));
        assert!(matches!(
            report.get("cluster").unwrap().state,
            ProvisioningState::Failed { .. }
        ));
        assert!(report.is_ready("ecr"));
        // The cluster was never attempted.
        assert!(!provider.calls().contains(&ProviderCall::Describe("cluster".to_string())));
        assert_eq!(provider.created(), vec!["vpc", "ecr"]);
    }

    #[tokio::test]
    async fn test_second_run_adopts_without_creating() {
        let first = Arc::new(SimulatedProvider::new());
        let report = Provisioner::new(first.clone())
            .provision(plan(vec![network(), cluster()], vec![]))
            .await;
        assert!(report.is_success());

        let second = Arc::new(SimulatedProvider::new().with_records(first.records()));
        let (mut rx, handle) =
            Provisioner::new(second.clone()).run(plan(vec![network(), cluster()], vec![]));
        let mut adopted = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ProvisionEvent::ResourceAdopted { name, .. } = event {
                adopted.push(name);
            }
        }
        let again = handle.await.unwrap();

        assert_eq!(adopted, vec!["vpc", "cluster"]);
        assert!(second.created().is_empty());
        assert_eq!(again.outputs("cluster"), report.outputs("cluster"));
    }

    #[tokio::test]
    async fn test_changed_inputs_update() {
        let first = Arc::new(SimulatedProvider::new());
        Provisioner::new(first.clone())
            .provision(plan(vec![network(), cluster()], vec![]))
            .await;

        let changed = cluster().with_input("label", InputValue::Literal("blue".to_string()));
        let second = Arc::new(SimulatedProvider::new().with_records(first.records()));
        Provisioner::new(second.clone())
            .provision(plan(vec![network(), changed], vec![]))
            .await;

        assert!(second.calls().contains(&ProviderCall::Update("cluster".to_string())));
        assert!(second.created().is_empty());
    }

    #[tokio::test]
    async fn test_grants_applied_once() {
        let provider = Arc::new(SimulatedProvider::new());
        let grant = Grant::new("repo", "ecr", Capability::PullPush);
        let report = Provisioner::new(provider.clone())
            .provision(plan(
                vec![repo("repo"), registry("ecr")],
                vec![grant.clone()],
            ))
            .await;

        assert!(report.is_success());
        assert!(report.has_grant(&grant));
        assert_eq!(provider.granted(), vec![grant.clone()]);

        // A later run that knows the grant does not apply it again.
        let again = Arc::new(SimulatedProvider::new().with_records(provider.records()));
        Provisioner::new(again.clone())
            .with_applied_grants(report.grants.clone())
            .provision(plan(vec![repo("repo"), registry("ecr")], vec![grant]))
            .await;
        assert!(again.granted().is_empty());
    }

    #[tokio::test]
    async fn test_grant_failure_fails_principal_and_dependents() {
        let provider = Arc::new(SimulatedProvider::new().fail_grants_for("repo"));
        let dependent = registry("mirror")
            .with_input("origin", InputValue::Ref(OutputRef::new("repo", "name")));

        let report = Provisioner::new(provider)
            .provision(plan(
                vec![repo("repo"), registry("ecr"), dependent],
                vec![Grant::new("repo", "ecr", Capability::PullPush)],
            ))
            .await;

        assert!(report.is_ready("ecr"));
        assert!(!report.is_ready("repo"));
        assert!(!report.is_ready("mirror"));
        assert_eq!(report.failed().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_output_key_fails_consumer() {
        let provider = Arc::new(SimulatedProvider::new());
        let consumer =
            registry("ecr").with_input("x", InputValue::Ref(OutputRef::new("vpc", "nope")));

        let report = Provisioner::new(provider.clone())
            .provision(plan(vec![network(), consumer], vec![]))
            .await;

        assert!(report.is_ready("vpc"));
        assert!(matches!(
            &report.get("ecr").unwrap().state,
            ProvisioningState::Failed { reason } if reason.contains("nope")
        ));
        assert_eq!(provider.created(), vec!["vpc"]);
    }

    #[tokio::test]
    async fn test_resolve_operator_outputs() {
        let provider = Arc::new(SimulatedProvider::new());
        let report = Provisioner::new(provider)
            .provision(plan(vec![repo("repo-front")], vec![]))
            .await;

        let outputs = report.resolve_outputs(&[
            StackOutput::new("FrontRepoName", OutputRef::new("repo-front", "name")),
            StackOutput::new("Missing", OutputRef::new("repo-back", "name")),
        ]);
        assert_eq!(
            outputs,
            vec![ResolvedOutput {
                name: "FrontRepoName".to_string(),
                value: "repo-front".to_string(),
            }]
        );
    }
}
