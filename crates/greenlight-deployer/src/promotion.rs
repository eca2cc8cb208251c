//! Blue/green promotion onto a cluster target.

use greenlight_core::Result;
use greenlight_core::deployer::{ClusterTarget, PromotionDecision, PromotionTarget, decide};
use std::sync::Arc;
use tracing::info;

/// Queries the cluster for the target deployment, decides between first
/// rollout and image patch, and carries the decision out.
#[derive(Clone)]
pub struct Promoter {
    cluster: Arc<dyn ClusterTarget>,
}

impl Promoter {
    pub fn new(cluster: Arc<dyn ClusterTarget>) -> Self {
        Self { cluster }
    }

    /// Promote `image` onto `target`. Returns the decision that was executed.
    pub async fn promote(&self, target: &PromotionTarget, image: &str) -> Result<PromotionDecision> {
        let observed = self.cluster.find_deployment(&target.deployment).await?;
        let decision = decide(target, image, observed.as_ref());

        match &decision {
            PromotionDecision::ApplyManifest(manifest) => {
                info!(
                    deployment = %target.deployment,
                    image = %image,
                    cluster = self.cluster.name(),
                    "First rollout, applying manifest"
                );
                self.cluster.apply_manifest(manifest).await?;
            }
            PromotionDecision::PatchImage {
                deployment,
                container,
                image,
            } => {
                info!(
                    deployment = %deployment,
                    image = %image,
                    previous = ?observed.as_ref().and_then(|d| d.image.as_deref()),
                    cluster = self.cluster.name(),
                    "Swapping image"
                );
                self.cluster.set_image(deployment, container, image).await?;
            }
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ClusterOperation, MemoryCluster};

    fn rolling_front() -> PromotionTarget {
        PromotionTarget::new("rolling-front", "ecr-front")
    }

    #[tokio::test]
    async fn test_first_promotion_creates_service_and_deployment() {
        let cluster = Arc::new(MemoryCluster::new());
        let promoter = Promoter::new(cluster.clone());

        let decision = promoter
            .promote(&rolling_front(), "registry/front:abc123")
            .await
            .unwrap();

        assert!(matches!(decision, PromotionDecision::ApplyManifest(_)));
        assert_eq!(
            cluster.image_of("rolling-front").as_deref(),
            Some("registry/front:abc123")
        );
        assert!(cluster.service("rolling-front").is_some());
    }

    #[tokio::test]
    async fn test_second_promotion_patches_image_only() {
        let cluster = Arc::new(MemoryCluster::new());
        let promoter = Promoter::new(cluster.clone());

        promoter
            .promote(&rolling_front(), "registry/front:abc123")
            .await
            .unwrap();
        let decision = promoter
            .promote(&rolling_front(), "registry/front:def456")
            .await
            .unwrap();

        assert_eq!(
            decision,
            PromotionDecision::PatchImage {
                deployment: "rolling-front".to_string(),
                container: "rolling-front".to_string(),
                image: "registry/front:def456".to_string(),
            }
        );
        let operations = cluster.operations();
        assert_eq!(operations.len(), 2);
        assert!(matches!(operations[1], ClusterOperation::SetImage { .. }));
        assert_eq!(
            cluster.image_of("rolling-front").as_deref(),
            Some("registry/front:def456")
        );
    }

    #[tokio::test]
    async fn test_other_deployment_is_not_patched() {
        let cluster = Arc::new(MemoryCluster::new());
        let promoter = Promoter::new(cluster.clone());

        promoter
            .promote(&PromotionTarget::new("rolling-back", "ecr-back"), "back:1")
            .await
            .unwrap();
        let decision = promoter
            .promote(&rolling_front(), "front:1")
            .await
            .unwrap();

        assert!(matches!(decision, PromotionDecision::ApplyManifest(_)));
        assert_eq!(cluster.image_of("rolling-back").as_deref(), Some("back:1"));
    }
}
