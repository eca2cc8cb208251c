//! Declared infrastructure resources.
//!
//! A [`Resource`] is declared once with its inputs and a kind-specific spec.
//! The provisioner later fills in its outputs and moves it through
//! [`ProvisioningState`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::buildspec::BuildPhase;
use crate::deployer::PromotionTarget;
use crate::pipeline::Pipeline;

/// Resolved identifiers of a provisioned resource (URIs, ARNs, names).
pub type Outputs = BTreeMap<String, String>;

/// Kind of a declared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    ComputeCluster,
    Registry,
    SourceRepo,
    BuildJob,
    Pipeline,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::ComputeCluster => write!(f, "compute-cluster"),
            ResourceKind::Registry => write!(f, "registry"),
            ResourceKind::SourceRepo => write!(f, "source-repo"),
            ResourceKind::BuildJob => write!(f, "build-job"),
            ResourceKind::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ResourceKind::Network),
            "compute-cluster" => Ok(ResourceKind::ComputeCluster),
            "registry" => Ok(ResourceKind::Registry),
            "source-repo" => Ok(ResourceKind::SourceRepo),
            "build-job" => Ok(ResourceKind::BuildJob),
            "pipeline" => Ok(ResourceKind::Pipeline),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Reference to one output key of another resource, written `resource.key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: String,
    pub key: String,
}

impl OutputRef {
    pub fn new(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            key: key.into(),
        }
    }

    /// Parse `resource.key`. Both halves must be non-empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (resource, key) = s.split_once('.')?;
        if resource.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(resource, key))
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource, self.key)
    }
}

/// A declared input: a literal or another resource's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputValue {
    Literal(String),
    Ref(OutputRef),
}

impl InputValue {
    pub fn as_output_ref(&self) -> Option<&OutputRef> {
        match self {
            InputValue::Ref(r) => Some(r),
            InputValue::Literal(_) => None,
        }
    }
}

/// Provisioning state of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisioningState {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Failed {
        reason: String,
    },
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Ready | ProvisioningState::Failed { .. }
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProvisioningState::Ready)
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Pending => write!(f, "pending"),
            ProvisioningState::Provisioning => write!(f, "provisioning"),
            ProvisioningState::Ready => write!(f, "ready"),
            ProvisioningState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// A network with a single address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub cidr: String,
    pub nat_gateways: u32,
}

/// A managed container cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub version: String,
    pub default_capacity: u32,
    /// Role mapped to cluster administrators. The provider names one when unset.
    pub masters_role: Option<String>,
    /// Port the control-plane security group admits from any address.
    pub ingress_port: u16,
}

/// Image registry. The provider picks the repository name when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySpec {
    pub repository_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRepoSpec {
    pub repository_name: String,
}

/// A build project bound to one source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJobSpec {
    /// Source repository resource the job checks out.
    pub source: String,
    /// Image the build runs in.
    pub image: String,
    /// Whether the build container runs privileged (docker-in-docker).
    pub privileged: bool,
    /// Environment, resolved against other resources at run time.
    pub env: BTreeMap<String, InputValue>,
    /// Ordered phases; validated into a `BuildSpec` when the job runs.
    pub phases: Vec<BuildPhase>,
    /// Where a promote action rolls the built image out.
    pub promotion: Option<PromotionTarget>,
}

/// Kind-specific part of a resource declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    Network(NetworkSpec),
    ComputeCluster(ClusterSpec),
    Registry(RegistrySpec),
    SourceRepo(SourceRepoSpec),
    BuildJob(BuildJobSpec),
    Pipeline(Pipeline),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Network(_) => ResourceKind::Network,
            ResourceSpec::ComputeCluster(_) => ResourceKind::ComputeCluster,
            ResourceSpec::Registry(_) => ResourceKind::Registry,
            ResourceSpec::SourceRepo(_) => ResourceKind::SourceRepo,
            ResourceSpec::BuildJob(_) => ResourceKind::BuildJob,
            ResourceSpec::Pipeline(_) => ResourceKind::Pipeline,
        }
    }
}

/// "consumer requires `key` of provider".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub consumer: String,
    pub provider: String,
    pub key: String,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Unique logical name.
    pub name: String,
    pub spec: ResourceSpec,
    /// Declared inputs, passed to the provider once resolved.
    pub inputs: BTreeMap<String, InputValue>,
    /// Filled in by the provisioner.
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    pub state: ProvisioningState,
}

impl Resource {
    pub fn new(name: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            inputs: BTreeMap::new(),
            outputs: Outputs::new(),
            state: ProvisioningState::Pending,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    /// Every edge this resource requires, explicit inputs first, then the
    /// references implied by its spec. Order is stable.
    pub fn dependencies(&self) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        let mut push = |provider: &str, key: &str| {
            let edge = DependencyEdge {
                consumer: self.name.clone(),
                provider: provider.to_string(),
                key: key.to_string(),
            };
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        };

        for value in self.inputs.values() {
            if let Some(r) = value.as_output_ref() {
                push(&r.resource, &r.key);
            }
        }

        match &self.spec {
            ResourceSpec::BuildJob(job) => {
                push(&job.source, "clone_url_http");
                for value in job.env.values() {
                    if let Some(r) = value.as_output_ref() {
                        push(&r.resource, &r.key);
                    }
                }
                if let Some(promotion) = &job.promotion {
                    push(&promotion.registry, "uri");
                }
            }
            ResourceSpec::Pipeline(pipeline) => {
                for action in pipeline.stages.iter().flat_map(|s| s.actions.iter()) {
                    if let Some(target) = action.resource() {
                        push(target, "name");
                    }
                }
            }
            _ => {}
        }

        edges
    }
}
