//! Cluster targets for Greenlight promotions.
//!
//! Provides target implementations:
//! - Kubernetes (production)
//! - In-memory cluster (local runs and tests)

pub mod kubernetes;
pub mod memory;
pub mod promotion;

pub use greenlight_core::deployer::{
    ClusterTarget, DeploymentState, Manifest, PromotionDecision, PromotionTarget, ReplicaStatus,
};
pub use kubernetes::KubernetesTarget;
pub use memory::{ClusterOperation, MemoryCluster};
pub use promotion::Promoter;
