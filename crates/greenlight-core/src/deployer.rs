//! Cluster target trait and the blue/green promotion decision.
//!
//! A promotion either creates a deployment from a full manifest (first
//! rollout) or patches only the container image of the running deployment,
//! leaving its service and replica configuration untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Default container port of promoted services.
pub const DEFAULT_SERVICE_PORT: u16 = 8080;

/// Where a build job's image is promoted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionTarget {
    /// Deployment (and service) name on the cluster, e.g. `rolling-front`.
    pub deployment: String,
    /// Container to patch; defaults to the deployment name.
    pub container: String,
    /// Registry resource the image is pushed to.
    pub registry: String,
    pub port: u16,
    pub replicas: u32,
}

impl PromotionTarget {
    pub fn new(deployment: impl Into<String>, registry: impl Into<String>) -> Self {
        let deployment = deployment.into();
        Self {
            container: deployment.clone(),
            deployment,
            registry: registry.into(),
            port: DEFAULT_SERVICE_PORT,
            replicas: 1,
        }
    }
}

/// Deployment observed on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub name: String,
    /// Image of the target container, when it could be read.
    pub image: Option<String>,
    pub replicas: ReplicaStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
}

/// Full manifest applied on first rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub deployment: DeploymentManifest,
    pub service: ServiceManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub name: String,
    pub container: String,
    pub image: String,
    pub replicas: u32,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    /// Value of the `app` label selected by the service.
    pub app: String,
}

impl Manifest {
    pub fn for_target(target: &PromotionTarget, image: impl Into<String>) -> Self {
        Self {
            deployment: DeploymentManifest {
                name: target.deployment.clone(),
                container: target.container.clone(),
                image: image.into(),
                replicas: target.replicas,
                container_port: target.port,
            },
            service: ServiceManifest {
                name: target.deployment.clone(),
                port: target.port,
                target_port: target.port,
                app: target.deployment.clone(),
            },
        }
    }
}

/// Outcome of the promotion decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PromotionDecision {
    /// Nothing is deployed under the target name: create service and deployment.
    ApplyManifest(Manifest),
    /// The target is serving: swap its container image only.
    PatchImage {
        deployment: String,
        container: String,
        image: String,
    },
}

/// Decide between first rollout and image patch.
///
/// `observed` is the result of querying the cluster for the target name; a
/// deployment under any other name does not count as existing.
pub fn decide(
    target: &PromotionTarget,
    image: &str,
    observed: Option<&DeploymentState>,
) -> PromotionDecision {
    match observed.filter(|d| d.name == target.deployment) {
        None => PromotionDecision::ApplyManifest(Manifest::for_target(target, image)),
        Some(_) => PromotionDecision::PatchImage {
            deployment: target.deployment.clone(),
            container: target.container.clone(),
            image: image.to_string(),
        },
    }
}

/// Trait for compute clusters that accept promotions.
#[async_trait]
pub trait ClusterTarget: Send + Sync {
    /// Name of this target backend.
    fn name(&self) -> &'static str;

    /// Look up a deployment by name.
    async fn find_deployment(&self, name: &str) -> Result<Option<DeploymentState>>;

    /// Create or update the service and deployment of a manifest.
    async fn apply_manifest(&self, manifest: &Manifest) -> Result<()>;

    /// Replace one container's image on an existing deployment.
    async fn set_image(&self, deployment: &str, container: &str, image: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn front() -> PromotionTarget {
        let mut target = PromotionTarget::new("rolling-front", "ecr-front");
        target.replicas = 2;
        target
    }

    fn observed(name: &str) -> DeploymentState {
        DeploymentState {
            name: name.to_string(),
            image: Some("registry/front:old".to_string()),
            replicas: ReplicaStatus {
                desired: 2,
                ready: 2,
                available: 2,
            },
        }
    }

    #[test]
    fn test_first_rollout_applies_manifest() {
        let decision = decide(&front(), "registry/front:abc123", None);
        match decision {
            PromotionDecision::ApplyManifest(manifest) => {
                assert_eq!(manifest.deployment.name, "rolling-front");
                assert_eq!(manifest.deployment.image, "registry/front:abc123");
                assert_eq!(manifest.deployment.replicas, 2);
                assert_eq!(manifest.service.name, "rolling-front");
                assert_eq!(manifest.service.port, DEFAULT_SERVICE_PORT);
            }
            other => panic!("expected manifest apply, got {:?}", other),
        }
    }

    #[test]
    fn test_existing_deployment_patches_image_only() {
        let existing = observed("rolling-front");
        let decision = decide(&front(), "registry/front:def456", Some(&existing));
        assert_eq!(
            decision,
            PromotionDecision::PatchImage {
                deployment: "rolling-front".to_string(),
                container: "rolling-front".to_string(),
                image: "registry/front:def456".to_string(),
            }
        );
    }

    #[test]
    fn test_other_deployment_does_not_count() {
        let other = observed("rolling-server");
        let decision = decide(&front(), "registry/front:abc", Some(&other));
        assert!(matches!(decision, PromotionDecision::ApplyManifest(_)));
    }
}
