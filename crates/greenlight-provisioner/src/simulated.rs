//! In-process provider that synthesizes identifiers instead of calling a cloud.
//!
//! Outputs follow the shapes a real control plane returns (ARNs, registry
//! URIs, clone URLs) and are stable for a given account, region and name, so
//! a state file written by one run is adopted verbatim by the next.

use async_trait::async_trait;
use greenlight_core::access::{Grant, GrantRequest};
use greenlight_core::provider::{CreateRequest, Provider, ResourceRecord};
use greenlight_core::resource::ResourceSpec;
use greenlight_core::{Error, Outputs, ResourceKind, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const DEFAULT_ACCOUNT: &str = "000000000000";
pub const DEFAULT_REGION: &str = "us-east-1";

/// A call received by the simulated provider, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Describe(String),
    Create(String),
    Update(String),
    Grant(Grant),
}

pub struct SimulatedProvider {
    account: String,
    region: String,
    records: Mutex<HashMap<String, ResourceRecord>>,
    grants: Mutex<Vec<Grant>>,
    calls: Mutex<Vec<ProviderCall>>,
    failing_creates: HashSet<String>,
    failing_grants: HashSet<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::with_account(DEFAULT_ACCOUNT, DEFAULT_REGION)
    }

    pub fn with_account(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
            records: Mutex::new(HashMap::new()),
            grants: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failing_creates: HashSet::new(),
            failing_grants: HashSet::new(),
        }
    }

    /// Seed records known from an earlier run.
    pub fn with_records(self, records: impl IntoIterator<Item = (String, ResourceRecord)>) -> Self {
        lock(&self.records).extend(records);
        self
    }

    /// Make create and update calls for `name` fail.
    pub fn fail_create(mut self, name: impl Into<String>) -> Self {
        self.failing_creates.insert(name.into());
        self
    }

    /// Make every grant held by `principal` fail.
    pub fn fail_grants_for(mut self, principal: impl Into<String>) -> Self {
        self.failing_grants.insert(principal.into());
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Names passed to `create`, in order.
    pub fn created(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Create(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn granted(&self) -> Vec<Grant> {
        lock(&self.grants).clone()
    }

    pub fn records(&self) -> HashMap<String, ResourceRecord> {
        lock(&self.records).clone()
    }

    fn record(&self, call: ProviderCall) {
        lock(&self.calls).push(call);
    }

    fn synthesize(&self, name: &str, spec: &ResourceSpec) -> Outputs {
        let (account, region) = (&self.account, &self.region);
        let mut outputs = Outputs::new();
        let mut put = |key: &str, value: String| {
            outputs.insert(key.to_string(), value);
        };

        match spec {
            ResourceSpec::Network(network) => {
                put("id", format!("vpc-{}", name));
                put("cidr", network.cidr.clone());
            }
            ResourceSpec::ComputeCluster(cluster) => {
                put("name", name.to_string());
                put("arn", format!("arn:aws:eks:{region}:{account}:cluster/{name}"));
                put(
                    "endpoint",
                    format!("https://{name}.eks.{region}.amazonaws.com"),
                );
                put("version", cluster.version.clone());
                let role = cluster
                    .masters_role
                    .clone()
                    .unwrap_or_else(|| format!("{name}-admin"));
                put("masters_role_arn", format!("arn:aws:iam::{account}:role/{role}"));
                put("security_group_id", format!("sg-{name}"));
                put("ingress_port", cluster.ingress_port.to_string());
            }
            ResourceSpec::Registry(registry) => {
                let repo = registry
                    .repository_name
                    .clone()
                    .unwrap_or_else(|| name.to_string());
                put(
                    "uri",
                    format!("{account}.dkr.ecr.{region}.amazonaws.com/{repo}"),
                );
                put("arn", format!("arn:aws:ecr:{region}:{account}:repository/{repo}"));
                put("name", repo);
            }
            ResourceSpec::SourceRepo(source) => {
                let repo = &source.repository_name;
                put("arn", format!("arn:aws:codecommit:{region}:{account}:{repo}"));
                put(
                    "clone_url_http",
                    format!("https://git-codecommit.{region}.amazonaws.com/v1/repos/{repo}"),
                );
                put(
                    "clone_url_ssh",
                    format!("ssh://git-codecommit.{region}.amazonaws.com/v1/repos/{repo}"),
                );
                put("name", repo.clone());
            }
            ResourceSpec::BuildJob(_) => {
                put("name", name.to_string());
                put("arn", format!("arn:aws:codebuild:{region}:{account}:project/{name}"));
            }
            ResourceSpec::Pipeline(_) => {
                put("name", name.to_string());
                put("arn", format!("arn:aws:codepipeline:{region}:{account}:{name}"));
            }
        }

        outputs
    }

    fn store(&self, request: &CreateRequest<'_>) -> Result<Outputs> {
        if self.failing_creates.contains(request.name) {
            return Err(Error::Provisioning {
                resource: request.name.to_string(),
                message: "simulated failure".to_string(),
            });
        }

        let outputs = self.synthesize(request.name, request.spec);
        lock(&self.records).insert(
            request.name.to_string(),
            ResourceRecord {
                kind: request.kind(),
                inputs: request.inputs.clone(),
                outputs: outputs.clone(),
            },
        );
        Ok(outputs)
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn describe(&self, name: &str, kind: ResourceKind) -> Result<Option<ResourceRecord>> {
        self.record(ProviderCall::Describe(name.to_string()));
        match lock(&self.records).get(name) {
            Some(record) if record.kind != kind => Err(Error::Conflict(format!(
                "'{}' exists as a {}, declared as a {}",
                name, record.kind, kind
            ))),
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn create(&self, request: &CreateRequest<'_>) -> Result<Outputs> {
        self.record(ProviderCall::Create(request.name.to_string()));
        debug!(resource = %request.name, kind = %request.kind(), "Creating simulated resource");
        self.store(request)
    }

    async fn update(&self, request: &CreateRequest<'_>) -> Result<Outputs> {
        self.record(ProviderCall::Update(request.name.to_string()));
        debug!(resource = %request.name, kind = %request.kind(), "Updating simulated resource");
        self.store(request)
    }

    async fn grant(&self, request: &GrantRequest<'_>) -> Result<()> {
        self.record(ProviderCall::Grant(request.grant.clone()));
        if self.failing_grants.contains(&request.grant.principal) {
            return Err(Error::Grant {
                principal: request.grant.principal.clone(),
                resource: request.grant.resource.clone(),
                capability: request.grant.capability.to_string(),
                message: "simulated denial".to_string(),
            });
        }
        lock(&self.grants).push(request.grant.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenlight_core::resource::{ClusterSpec, RegistrySpec, SourceRepoSpec};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_registry_outputs() {
        let provider = SimulatedProvider::with_account("123456789012", "eu-west-1");
        let spec = ResourceSpec::Registry(RegistrySpec::default());
        let inputs = BTreeMap::new();
        let outputs = provider
            .create(&CreateRequest {
                name: "ecr-front",
                spec: &spec,
                inputs: &inputs,
            })
            .await
            .unwrap();

        assert_eq!(
            outputs["uri"],
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/ecr-front"
        );
        assert_eq!(outputs["name"], "ecr-front");
        assert!(outputs["arn"].starts_with("arn:aws:ecr:eu-west-1:123456789012:"));
    }

    #[tokio::test]
    async fn test_cluster_outputs() {
        let provider = SimulatedProvider::with_account("123456789012", "eu-west-1");
        let inputs = BTreeMap::new();
        let mut cluster = ClusterSpec {
            version: "1.21".to_string(),
            default_capacity: 2,
            masters_role: None,
            ingress_port: 80,
        };

        let spec = ResourceSpec::ComputeCluster(cluster.clone());
        let outputs = provider
            .create(&CreateRequest {
                name: "cluster",
                spec: &spec,
                inputs: &inputs,
            })
            .await
            .unwrap();
        assert_eq!(
            outputs["masters_role_arn"],
            "arn:aws:iam::123456789012:role/cluster-admin"
        );
        assert_eq!(outputs["security_group_id"], "sg-cluster");
        assert_eq!(outputs["ingress_port"], "80");
        assert_eq!(outputs["version"], "1.21");

        cluster.masters_role = Some("ops".to_string());
        cluster.ingress_port = 8443;
        let spec = ResourceSpec::ComputeCluster(cluster);
        let outputs = provider
            .create(&CreateRequest {
                name: "other",
                spec: &spec,
                inputs: &inputs,
            })
            .await
            .unwrap();
        assert!(outputs["masters_role_arn"].ends_with(":role/ops"));
        assert_eq!(outputs["ingress_port"], "8443");
    }

    #[tokio::test]
    async fn test_source_repo_outputs() {
        let provider = SimulatedProvider::new();
        let spec = ResourceSpec::SourceRepo(SourceRepoSpec {
            repository_name: "demo-repo-Front".to_string(),
        });
        let inputs = BTreeMap::new();
        let outputs = provider
            .create(&CreateRequest {
                name: "repo-front",
                spec: &spec,
                inputs: &inputs,
            })
            .await
            .unwrap();

        for key in ["name", "arn", "clone_url_ssh", "clone_url_http"] {
            assert!(outputs.contains_key(key), "missing {}", key);
        }
        assert!(outputs["clone_url_http"].ends_with("/v1/repos/demo-repo-Front"));
    }

    #[tokio::test]
    async fn test_describe_after_create() {
        let provider = SimulatedProvider::new();
        let spec = ResourceSpec::Registry(RegistrySpec::default());
        let inputs = BTreeMap::new();
        let request = CreateRequest {
            name: "ecr",
            spec: &spec,
            inputs: &inputs,
        };

        assert!(
            provider
                .describe("ecr", ResourceKind::Registry)
                .await
                .unwrap()
                .is_none()
        );
        let outputs = provider.create(&request).await.unwrap();
        let record = provider
            .describe("ecr", ResourceKind::Registry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.outputs, outputs);

        assert!(matches!(
            provider.describe("ecr", ResourceKind::SourceRepo).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let provider = SimulatedProvider::new().fail_create("ecr");
        let spec = ResourceSpec::Registry(RegistrySpec::default());
        let inputs = BTreeMap::new();
        let result = provider
            .create(&CreateRequest {
                name: "ecr",
                spec: &spec,
                inputs: &inputs,
            })
            .await;
        assert!(matches!(result, Err(Error::Provisioning { .. })));
        assert!(provider.records().is_empty());
    }
}
