//! Topology file parsing.
//!
//! A topology declares the whole stack: infrastructure resources, build jobs,
//! grants between them, commit triggers, pipelines and the outputs an
//! operator gets back after provisioning.

use crate::variables::{RESERVED_NAMESPACES, VariableContext, VariableContextBuilder};
use crate::{ConfigError, ConfigResult};
use greenlight_core::access::{Capability, Grant};
use greenlight_core::buildspec::{BuildPhase, PhaseName};
use greenlight_core::deployer::PromotionTarget;
use greenlight_core::pipeline::{Action, CommitBinding, Pipeline, Stage, StageKind};
use greenlight_core::resource::{
    BuildJobSpec, ClusterSpec, NetworkSpec, RegistrySpec, ResourceSpec, SourceRepoSpec,
};
use greenlight_core::{InputValue, OutputRef, Resource, ResourceKind};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const DEFAULT_CIDR: &str = "10.0.0.0/16";
const DEFAULT_NAT_GATEWAYS: u32 = 1;
const DEFAULT_CLUSTER_VERSION: &str = "1.21";
const DEFAULT_CLUSTER_CAPACITY: u32 = 2;
const DEFAULT_INGRESS_PORT: u16 = 80;

/// A parsed, validated topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub stack: String,
    /// Resources in declaration order.
    pub resources: Vec<Resource>,
    pub grants: Vec<Grant>,
    pub triggers: Vec<CommitBinding>,
    /// Outputs declared with `output` nodes.
    pub outputs: Vec<StackOutput>,
}

/// A named value reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub name: String,
    pub from: OutputRef,
}

impl StackOutput {
    pub fn new(name: impl Into<String>, from: OutputRef) -> Self {
        Self {
            name: name.into(),
            from,
        }
    }
}

impl Topology {
    /// Read and parse a topology file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_topology(&text)
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn build_job(&self, name: &str) -> Option<&BuildJobSpec> {
        match self.resource(name).map(|r| &r.spec) {
            Some(ResourceSpec::BuildJob(job)) => Some(job),
            _ => None,
        }
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.resources.iter().filter_map(|r| match &r.spec {
            ResourceSpec::Pipeline(p) => Some(p),
            _ => None,
        })
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines().find(|p| p.name == name)
    }

    /// Pipelines whose source stage watches `repository`.
    pub fn pipelines_watching<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a Pipeline> + 'a {
        self.pipelines()
            .filter(move |p| p.source_repositories().contains(&repository))
    }

    /// Everything reported after provisioning: name, ARN and clone URLs of
    /// every source repository, name and ARN of every cluster, then the
    /// declared outputs.
    pub fn operator_outputs(&self) -> Vec<StackOutput> {
        let mut outputs = Vec::new();
        for resource in &self.resources {
            let keys: &[&str] = match resource.kind() {
                ResourceKind::SourceRepo => &["name", "arn", "clone_url_ssh", "clone_url_http"],
                ResourceKind::ComputeCluster => &["name", "arn"],
                _ => &[],
            };
            for key in keys {
                outputs.push(StackOutput::new(
                    format!("{}.{}", resource.name, key),
                    OutputRef::new(&resource.name, *key),
                ));
            }
        }
        outputs.extend(self.outputs.iter().cloned());
        outputs
    }
}

/// Parse a topology from KDL text.
pub fn parse_topology(kdl: &str) -> ConfigResult<Topology> {
    let doc: KdlDocument = kdl.parse()?;

    let stack = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "stack")
        .and_then(get_first_string_arg)
        .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;

    // Only stack variables are known while parsing; the rest stay for run time.
    let ctx = VariableContextBuilder::new().stack(&stack).build();

    let mut resources = Vec::new();
    let mut grants = Vec::new();
    let mut triggers = Vec::new();
    let mut outputs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "resource" => resources.push(parse_resource(node, &ctx)?),
            "build" => resources.push(parse_build(node, &ctx)?),
            "pipeline" => resources.push(parse_pipeline(node)?),
            "grant" => grants.push(parse_grant(node)?),
            "trigger" => triggers.push(parse_trigger(node)?),
            "output" => outputs.push(parse_output(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let topology = Topology {
        stack,
        resources,
        grants,
        triggers,
        outputs,
    };
    validate(&topology)?;
    Ok(topology)
}

fn parse_resource(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<Resource> {
    let name = resource_name(node, "resource")?;
    let kind_str = get_string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("kind for resource '{}'", name)))?;
    let kind: ResourceKind = kind_str.parse().map_err(|message| ConfigError::InvalidValue {
        field: format!("resource '{}' kind", name),
        message,
    })?;

    let spec = match kind {
        ResourceKind::Network => ResourceSpec::Network(NetworkSpec {
            cidr: child_string(node, "cidr", ctx).unwrap_or_else(|| DEFAULT_CIDR.to_string()),
            nat_gateways: child_u32(node, "nat-gateways")?.unwrap_or(DEFAULT_NAT_GATEWAYS),
        }),
        ResourceKind::ComputeCluster => ResourceSpec::ComputeCluster(ClusterSpec {
            version: child_string(node, "version", ctx)
                .unwrap_or_else(|| DEFAULT_CLUSTER_VERSION.to_string()),
            default_capacity: child_u32(node, "capacity")?.unwrap_or(DEFAULT_CLUSTER_CAPACITY),
            masters_role: child_string(node, "masters-role", ctx),
            ingress_port: child_port(node, "ingress-port")?.unwrap_or(DEFAULT_INGRESS_PORT),
        }),
        ResourceKind::Registry => ResourceSpec::Registry(RegistrySpec {
            repository_name: child_string(node, "repository-name", ctx),
        }),
        ResourceKind::SourceRepo => ResourceSpec::SourceRepo(SourceRepoSpec {
            repository_name: child_string(node, "repository-name", ctx)
                .unwrap_or_else(|| name.clone()),
        }),
        ResourceKind::BuildJob | ResourceKind::Pipeline => {
            return Err(ConfigError::InvalidValue {
                field: format!("resource '{}' kind", name),
                message: format!("declare {} resources with a '{}' node", kind, node_for(kind)),
            });
        }
    };

    let mut resource = Resource::new(name, spec);
    if let Some(children) = node.children() {
        for child in children.nodes().iter().filter(|c| c.name().value() == "input") {
            let (key, value) = match parse_input(child, "input")? {
                (key, InputValue::Literal(v)) => (key, InputValue::Literal(ctx.interpolate(&v))),
                input => input,
            };
            resource = resource.with_input(key, value);
        }
    }

    Ok(resource)
}

fn node_for(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::BuildJob => "build",
        _ => "pipeline",
    }
}

/// `<node> "KEY" from="resource.key"` or `<node> "KEY" "literal"`.
fn parse_input(node: &KdlNode, what: &str) -> ConfigResult<(String, InputValue)> {
    let args = get_all_string_args(node);
    let key = args
        .first()
        .cloned()
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", what)))?;

    if let Some(from) = get_string_prop(node, "from") {
        let r = OutputRef::parse(&from).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{} '{}'", what, key),
            message: format!("expected 'resource.key', got '{}'", from),
        })?;
        return Ok((key, InputValue::Ref(r)));
    }

    let literal = args.get(1).ok_or_else(|| {
        ConfigError::MissingField(format!("value or from= for {} '{}'", what, key))
    })?;
    Ok((key, InputValue::Literal(literal.clone())))
}

fn parse_build(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<Resource> {
    let name = resource_name(node, "build")?;
    let source = get_string_prop(node, "source")
        .ok_or_else(|| ConfigError::MissingField(format!("source for build '{}'", name)))?;

    let mut image = String::new();
    let mut privileged = false;
    let mut env = BTreeMap::new();
    let mut phases: Vec<BuildPhase> = Vec::new();
    let mut promotion = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child)
                        .map(|s| ctx.interpolate(&s))
                        .unwrap_or_default();
                }
                "privileged" => {
                    privileged = get_first_bool_arg(child).unwrap_or(true);
                }
                // Env literals are interpolated per run, once commit and lane are known.
                "env" => {
                    let (key, value) = parse_input(child, "env")?;
                    env.insert(key, value);
                }
                "phase" => {
                    phases.push(parse_phase(child, &name)?);
                }
                "promote" => {
                    promotion = Some(parse_promotion(child, &name)?);
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for build '{}'",
            name
        )));
    }

    Ok(Resource::new(
        name,
        ResourceSpec::BuildJob(BuildJobSpec {
            source,
            image,
            privileged,
            env,
            phases,
            promotion,
        }),
    ))
}

fn parse_phase(node: &KdlNode, job: &str) -> ConfigResult<BuildPhase> {
    let phase = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("phase name in build '{}'", job)))?;
    let name: PhaseName = phase.parse().map_err(|message| ConfigError::InvalidValue {
        field: format!("phase in build '{}'", job),
        message,
    })?;

    // Commands stay uninterpolated: they may reference commit and output
    // variables only known when the job runs.
    let commands = node
        .children()
        .map(|children| {
            children
                .nodes()
                .iter()
                .filter(|c| c.name().value() == "run")
                .flat_map(get_all_string_args)
                .collect()
        })
        .unwrap_or_default();

    Ok(BuildPhase::new(name, commands))
}

fn parse_promotion(node: &KdlNode, job: &str) -> ConfigResult<PromotionTarget> {
    let deployment = get_string_prop(node, "target")
        .or_else(|| get_first_string_arg(node))
        .ok_or_else(|| ConfigError::MissingField(format!("promote target in build '{}'", job)))?;
    let registry = get_string_prop(node, "registry").ok_or_else(|| {
        ConfigError::MissingField(format!("promote registry in build '{}'", job))
    })?;

    let mut target = PromotionTarget::new(deployment, registry);
    if let Some(container) = get_string_prop(node, "container") {
        target.container = container;
    }
    if let Some(port) = get_int_prop(node, "port") {
        target.port = u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
            field: format!("promote port in build '{}'", job),
            message: format!("{} is not a valid port", port),
        })?;
    }
    if let Some(replicas) = get_int_prop(node, "replicas") {
        target.replicas = u32::try_from(replicas).map_err(|_| ConfigError::InvalidValue {
            field: format!("promote replicas in build '{}'", job),
            message: format!("{} is not a valid replica count", replicas),
        })?;
    }
    Ok(target)
}

fn parse_pipeline(node: &KdlNode) -> ConfigResult<Resource> {
    let name = resource_name(node, "pipeline")?;

    let mut stages = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes().iter().filter(|c| c.name().value() == "stage") {
            stages.push(parse_stage(child, &name)?);
        }
    }

    let pipeline = Pipeline {
        name: name.clone(),
        stages,
    };
    pipeline
        .validate()
        .map_err(|e| ConfigError::InvalidValue {
            field: format!("pipeline '{}'", name),
            message: e.to_string(),
        })?;

    Ok(Resource::new(name, ResourceSpec::Pipeline(pipeline)))
}

fn parse_stage(node: &KdlNode, pipeline: &str) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node).ok_or_else(|| {
        ConfigError::MissingField(format!("stage name in pipeline '{}'", pipeline))
    })?;

    let mut actions = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let kind = child.name().value();
            let target = get_first_string_arg(child).ok_or_else(|| {
                ConfigError::MissingField(format!("{} target in stage '{}'", kind, name))
            })?;
            let action = match kind {
                "source" => Action::Source { repository: target },
                "build" => Action::Build { job: target },
                "approval" => Action::Approval { gate: target },
                "promote" => Action::Promote { job: target },
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("stage '{}'", name),
                        message: format!("unknown action: {}", other),
                    });
                }
            };
            actions.push(action);
        }
    }

    Ok(Stage::new(name, actions))
}

fn parse_grant(node: &KdlNode) -> ConfigResult<Grant> {
    let principal = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("grant principal".to_string()))?;
    let resource = get_string_prop(node, "resource")
        .ok_or_else(|| ConfigError::MissingField(format!("resource for grant to '{}'", principal)))?;
    let capability: Capability = get_string_prop(node, "capability")
        .ok_or_else(|| {
            ConfigError::MissingField(format!("capability for grant to '{}'", principal))
        })?
        .parse()
        .map_err(|message| ConfigError::InvalidValue {
            field: format!("grant to '{}'", principal),
            message,
        })?;

    Ok(Grant::new(principal, resource, capability))
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<CommitBinding> {
    let repository = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("trigger repository".to_string()))?;
    let job = get_string_prop(node, "build")
        .ok_or_else(|| ConfigError::MissingField(format!("build for trigger '{}'", repository)))?;
    Ok(CommitBinding::new(repository, job))
}

fn parse_output(node: &KdlNode) -> ConfigResult<StackOutput> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("output name".to_string()))?;
    let from = get_string_prop(node, "from")
        .ok_or_else(|| ConfigError::MissingField(format!("from for output '{}'", name)))?;
    let r = OutputRef::parse(&from).ok_or_else(|| ConfigError::InvalidValue {
        field: format!("output '{}'", name),
        message: format!("expected 'resource.key', got '{}'", from),
    })?;
    Ok(StackOutput::new(name, r))
}

fn resource_name(node: &KdlNode, what: &str) -> ConfigResult<String> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", what)))?;
    if RESERVED_NAMESPACES.contains(&name.as_str()) {
        return Err(ConfigError::ReservedName(name));
    }
    Ok(name)
}

/// Cross-node checks. Dependency edges between resources (unknown providers,
/// cycles) are checked by the graph builder, not here.
fn validate(topology: &Topology) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for resource in &topology.resources {
        if !seen.insert(resource.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "resource '{}'",
                resource.name
            )));
        }
    }

    let kind_of = |name: &str| topology.resource(name).map(|r| r.kind());
    let expect_kind = |name: &str, kind: ResourceKind, what: String| -> ConfigResult<()> {
        match kind_of(name) {
            Some(actual) if actual != kind => Err(ConfigError::InvalidValue {
                field: what,
                message: format!("'{}' is a {}, expected a {}", name, actual, kind),
            }),
            _ => Ok(()),
        }
    };

    for resource in &topology.resources {
        match &resource.spec {
            ResourceSpec::BuildJob(job) => {
                expect_kind(
                    &job.source,
                    ResourceKind::SourceRepo,
                    format!("source of build '{}'", resource.name),
                )?;
                if let Some(promotion) = &job.promotion {
                    expect_kind(
                        &promotion.registry,
                        ResourceKind::Registry,
                        format!("promote registry of build '{}'", resource.name),
                    )?;
                }
            }
            ResourceSpec::Pipeline(pipeline) => {
                for stage in &pipeline.stages {
                    for action in &stage.actions {
                        let (target, kind) = match action {
                            Action::Source { repository } => (repository, ResourceKind::SourceRepo),
                            Action::Build { job } | Action::Promote { job } => {
                                (job, ResourceKind::BuildJob)
                            }
                            Action::Approval { .. } => continue,
                        };
                        let what = format!("stage '{}' of pipeline '{}'", stage.name, pipeline.name);
                        expect_kind(target, kind, what.clone())?;
                        if stage.kind() == Some(StageKind::Promote)
                            && topology
                                .build_job(target)
                                .is_some_and(|job| job.promotion.is_none())
                        {
                            return Err(ConfigError::InvalidValue {
                                field: what,
                                message: format!("build '{}' has no promote target", target),
                            });
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut grants = HashSet::new();
    for grant in &topology.grants {
        if !grants.insert(grant) {
            return Err(ConfigError::Duplicate(format!("grant {}", grant)));
        }
        if kind_of(&grant.principal).is_none() {
            return Err(ConfigError::InvalidReference(format!(
                "grant principal '{}' is not declared",
                grant.principal
            )));
        }
        match kind_of(&grant.resource) {
            None => {
                return Err(ConfigError::InvalidReference(format!(
                    "grant resource '{}' is not declared",
                    grant.resource
                )));
            }
            Some(kind) if kind != grant.capability.target_kind() => {
                return Err(ConfigError::InvalidValue {
                    field: format!("grant {}", grant),
                    message: format!(
                        "{} applies to a {}, '{}' is a {}",
                        grant.capability,
                        grant.capability.target_kind(),
                        grant.resource,
                        kind
                    ),
                });
            }
            Some(_) => {}
        }
    }

    for trigger in &topology.triggers {
        if kind_of(&trigger.repository) != Some(ResourceKind::SourceRepo) {
            return Err(ConfigError::InvalidReference(format!(
                "trigger repository '{}' is not a declared source-repo",
                trigger.repository
            )));
        }
        if kind_of(&trigger.job) != Some(ResourceKind::BuildJob) {
            return Err(ConfigError::InvalidReference(format!(
                "trigger build '{}' is not a declared build",
                trigger.job
            )));
        }
    }

    let mut names = HashSet::new();
    for output in &topology.outputs {
        if !names.insert(output.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("output '{}'", output.name)));
        }
        if kind_of(&output.from.resource).is_none() {
            return Err(ConfigError::InvalidReference(format!(
                "output '{}' reads undeclared resource '{}'",
                output.name, output.from.resource
            )));
        }
    }

    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn find_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == name)
}

fn child_string(node: &KdlNode, name: &str, ctx: &VariableContext) -> Option<String> {
    find_child(node, name)
        .and_then(get_first_string_arg)
        .map(|s| ctx.interpolate(&s))
}

fn child_u32(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    let Some(value) = find_child(node, name).and_then(get_first_int_arg) else {
        return Ok(None);
    };
    u32::try_from(value)
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("{} is out of range", value),
        })
}

fn child_port(node: &KdlNode, name: &str) -> ConfigResult<Option<u16>> {
    let Some(value) = child_u32(node, name)? else {
        return Ok(None);
    };
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(Some(port)),
        _ => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("{} is not a valid port", value),
        }),
    }
}
