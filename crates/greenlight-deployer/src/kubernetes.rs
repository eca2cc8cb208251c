//! Kubernetes cluster target.

use async_trait::async_trait;
use greenlight_core::deployer::*;
use greenlight_core::{Error, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::info;

const FIELD_MANAGER: &str = "greenlight";

/// Promotes images onto deployments in one namespace.
pub struct KubernetesTarget {
    client: Client,
    namespace: String,
}

impl KubernetesTarget {
    /// Connect using the ambient kubeconfig or in-cluster credentials.
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

fn failed(action: &str, name: &str, err: kube::Error) -> Error {
    Error::DeploymentFailed(format!("{} '{}': {}", action, name, err))
}

fn build_deployment(manifest: &DeploymentManifest, namespace: &str) -> Deployment {
    let labels = app_labels(&manifest.name);
    Deployment {
        metadata: ObjectMeta {
            name: Some(manifest.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(manifest.replicas as i32),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: manifest.container.clone(),
                        image: Some(manifest.image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: i32::from(manifest.container_port),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(manifest: &ServiceManifest, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(manifest.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(&manifest.app)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(app_labels(&manifest.app)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: i32::from(manifest.port),
                target_port: Some(IntOrString::Int(i32::from(manifest.target_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn image_patch(container: &str, image: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{ "name": container, "image": image }]
                }
            }
        }
    })
}

/// Read the observed state of a deployment. The image is taken from the
/// container named after the deployment, falling back to the first container.
fn observe(name: &str, deployment: &Deployment) -> DeploymentState {
    let spec = deployment.spec.as_ref();
    let status = deployment.status.as_ref();
    let containers = spec
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or_default();
    let image = containers
        .iter()
        .find(|c| c.name == name)
        .or_else(|| containers.first())
        .and_then(|c| c.image.clone());
    let count = |v: Option<i32>| v.unwrap_or(0).max(0) as u32;

    DeploymentState {
        name: name.to_string(),
        image,
        replicas: ReplicaStatus {
            desired: count(spec.and_then(|s| s.replicas)),
            ready: count(status.and_then(|s| s.ready_replicas)),
            available: count(status.and_then(|s| s.available_replicas)),
        },
    }
}

#[async_trait]
impl ClusterTarget for KubernetesTarget {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn find_deployment(&self, name: &str) -> Result<Option<DeploymentState>> {
        let found = self
            .deployments()
            .get_opt(name)
            .await
            .map_err(|e| failed("read deployment", name, e))?;
        Ok(found.map(|d| observe(name, &d)))
    }

    async fn apply_manifest(&self, manifest: &Manifest) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let service = build_service(&manifest.service, &self.namespace);
        info!(service = %manifest.service.name, namespace = %self.namespace, "Applying service");
        self.services()
            .patch(&manifest.service.name, &params, &Patch::Apply(&service))
            .await
            .map_err(|e| failed("apply service", &manifest.service.name, e))?;

        let deployment = build_deployment(&manifest.deployment, &self.namespace);
        info!(
            deployment = %manifest.deployment.name,
            image = %manifest.deployment.image,
            "Applying deployment"
        );
        self.deployments()
            .patch(&manifest.deployment.name, &params, &Patch::Apply(&deployment))
            .await
            .map_err(|e| failed("apply deployment", &manifest.deployment.name, e))?;
        Ok(())
    }

    async fn set_image(&self, deployment: &str, container: &str, image: &str) -> Result<()> {
        info!(deployment = %deployment, container = %container, image = %image, "Patching image");
        self.deployments()
            .patch(
                deployment,
                &PatchParams::default(),
                &Patch::Strategic(image_patch(container, image)),
            )
            .await
            .map_err(|e| failed("patch image of", deployment, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn manifest() -> Manifest {
        let mut target = PromotionTarget::new("rolling-front", "ecr-front");
        target.replicas = 3;
        Manifest::for_target(&target, "registry/front:abc123")
    }

    #[test]
    fn test_deployment_selects_its_pods() {
        let deployment = build_deployment(&manifest().deployment, "apps");
        let spec = deployment.spec.unwrap();

        assert_eq!(deployment.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.selector.match_labels,
            spec.template.metadata.unwrap().labels
        );

        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, "rolling-front");
        assert_eq!(container.image.as_deref(), Some("registry/front:abc123"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
    }

    #[test]
    fn test_service_targets_app_label() {
        let service = build_service(&manifest().service, "apps");
        let spec = service.spec.unwrap();

        assert_eq!(spec.selector, Some(app_labels("rolling-front")));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn test_image_patch_only_touches_container_image() {
        let patch = image_patch("rolling-front", "registry/front:def456");
        let containers = &patch["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[0]["name"], "rolling-front");
        assert_eq!(containers[0]["image"], "registry/front:def456");
        assert_eq!(containers[0].as_object().unwrap().len(), 2);
        assert!(patch["spec"].get("replicas").is_none());
    }

    #[test]
    fn test_observe_reads_replicas_and_image() {
        let mut deployment = build_deployment(&manifest().deployment, "apps");
        deployment.status = Some(DeploymentStatus {
            ready_replicas: Some(2),
            available_replicas: Some(1),
            ..Default::default()
        });

        let state = observe("rolling-front", &deployment);
        assert_eq!(state.image.as_deref(), Some("registry/front:abc123"));
        assert_eq!(
            state.replicas,
            ReplicaStatus {
                desired: 3,
                ready: 2,
                available: 1,
            }
        );
    }

    #[test]
    fn test_observe_without_status() {
        let state = observe("empty", &Deployment::default());
        assert_eq!(state.image, None);
        assert_eq!(state.replicas, ReplicaStatus::default());
    }
}
