//! In-memory cluster target.

use async_trait::async_trait;
use greenlight_core::deployer::*;
use greenlight_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Operation received by a [`MemoryCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOperation {
    ApplyManifest(Manifest),
    SetImage {
        deployment: String,
        container: String,
        image: String,
    },
}

struct Workload {
    container: String,
    image: String,
    replicas: u32,
}

/// Cluster that keeps deployments in memory. Every replica is reported ready.
#[derive(Default)]
pub struct MemoryCluster {
    deployments: Mutex<BTreeMap<String, Workload>>,
    services: Mutex<BTreeMap<String, ServiceManifest>>,
    operations: Mutex<Vec<ClusterOperation>>,
    reject_apply: bool,
    reject_set_image: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every manifest apply fails with [`Error::DeploymentFailed`].
    pub fn fail_apply(mut self) -> Self {
        self.reject_apply = true;
        self
    }

    /// Every image patch fails with [`Error::DeploymentFailed`].
    pub fn fail_set_image(mut self) -> Self {
        self.reject_set_image = true;
        self
    }

    /// Operations received so far, in order.
    pub fn operations(&self) -> Vec<ClusterOperation> {
        lock(&self.operations).clone()
    }

    /// Current image of a deployment's container.
    pub fn image_of(&self, deployment: &str) -> Option<String> {
        lock(&self.deployments)
            .get(deployment)
            .map(|w| w.image.clone())
    }

    pub fn service(&self, name: &str) -> Option<ServiceManifest> {
        lock(&self.services).get(name).cloned()
    }
}

#[async_trait]
impl ClusterTarget for MemoryCluster {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn find_deployment(&self, name: &str) -> Result<Option<DeploymentState>> {
        Ok(lock(&self.deployments).get(name).map(|w| DeploymentState {
            name: name.to_string(),
            image: Some(w.image.clone()),
            replicas: ReplicaStatus {
                desired: w.replicas,
                ready: w.replicas,
                available: w.replicas,
            },
        }))
    }

    async fn apply_manifest(&self, manifest: &Manifest) -> Result<()> {
        if self.reject_apply {
            return Err(Error::DeploymentFailed(format!(
                "cluster refused manifest for '{}'",
                manifest.deployment.name
            )));
        }
        info!(deployment = %manifest.deployment.name, "Applying manifest in memory");
        lock(&self.services).insert(manifest.service.name.clone(), manifest.service.clone());
        lock(&self.deployments).insert(
            manifest.deployment.name.clone(),
            Workload {
                container: manifest.deployment.container.clone(),
                image: manifest.deployment.image.clone(),
                replicas: manifest.deployment.replicas,
            },
        );
        lock(&self.operations).push(ClusterOperation::ApplyManifest(manifest.clone()));
        Ok(())
    }

    async fn set_image(&self, deployment: &str, container: &str, image: &str) -> Result<()> {
        if self.reject_set_image {
            return Err(Error::DeploymentFailed(format!(
                "cluster refused image patch for '{}'",
                deployment
            )));
        }
        {
            let mut deployments = lock(&self.deployments);
            let workload = deployments
                .get_mut(deployment)
                .ok_or_else(|| Error::NotFound(format!("deployment {}", deployment)))?;
            if workload.container != container {
                return Err(Error::DeploymentFailed(format!(
                    "deployment '{}' has no container '{}'",
                    deployment, container
                )));
            }
            workload.image = image.to_string();
        }

        info!(deployment = %deployment, image = %image, "Patched image in memory");
        lock(&self.operations).push(ClusterOperation::SetImage {
            deployment: deployment.to_string(),
            container: container.to_string(),
            image: image.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(image: &str) -> Manifest {
        Manifest::for_target(&PromotionTarget::new("rolling-front", "ecr"), image)
    }

    #[tokio::test]
    async fn test_apply_then_find() {
        let cluster = MemoryCluster::new();
        assert!(
            cluster
                .find_deployment("rolling-front")
                .await
                .unwrap()
                .is_none()
        );

        cluster.apply_manifest(&manifest("front:1")).await.unwrap();
        let state = cluster
            .find_deployment("rolling-front")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.image.as_deref(), Some("front:1"));
        assert_eq!(state.replicas.ready, 1);
        assert_eq!(cluster.service("rolling-front").unwrap().port, 8080);
    }

    #[tokio::test]
    async fn test_set_image_requires_existing_deployment() {
        let cluster = MemoryCluster::new();
        let err = cluster
            .set_image("rolling-front", "rolling-front", "front:2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn test_set_image_checks_container() {
        let cluster = MemoryCluster::new();
        cluster.apply_manifest(&manifest("front:1")).await.unwrap();

        assert!(cluster.set_image("rolling-front", "sidecar", "x").await.is_err());
        cluster
            .set_image("rolling-front", "rolling-front", "front:2")
            .await
            .unwrap();
        assert_eq!(cluster.image_of("rolling-front").as_deref(), Some("front:2"));
        assert_eq!(cluster.operations().len(), 2);
    }

    #[tokio::test]
    async fn test_configured_failures_record_nothing() {
        let cluster = MemoryCluster::new().fail_apply();
        let err = cluster.apply_manifest(&manifest("front:1")).await.unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(_)));
        assert!(cluster.image_of("rolling-front").is_none());
        assert!(cluster.operations().is_empty());

        let cluster = MemoryCluster::new().fail_set_image();
        cluster.apply_manifest(&manifest("front:1")).await.unwrap();
        let err = cluster
            .set_image("rolling-front", "rolling-front", "front:2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(_)));
        assert_eq!(cluster.image_of("rolling-front").as_deref(), Some("front:1"));
    }
}
