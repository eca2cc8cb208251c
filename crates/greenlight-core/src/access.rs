//! Cross-resource permissions.

use serde::{Deserialize, Serialize};

use crate::resource::{Outputs, ResourceKind};

/// Permission a principal holds on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Push and pull images of a registry.
    PullPush,
    /// Enrollment as cluster administrator.
    ClusterAdmin,
    /// Read the cluster endpoint and certificate.
    DescribeCluster,
}

impl Capability {
    /// Resource kind this capability can be granted on.
    pub fn target_kind(&self) -> ResourceKind {
        match self {
            Capability::PullPush => ResourceKind::Registry,
            Capability::ClusterAdmin | Capability::DescribeCluster => ResourceKind::ComputeCluster,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::PullPush => write!(f, "pull-push"),
            Capability::ClusterAdmin => write!(f, "cluster-admin"),
            Capability::DescribeCluster => write!(f, "describe-cluster"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull-push" => Ok(Capability::PullPush),
            "cluster-admin" => Ok(Capability::ClusterAdmin),
            "describe-cluster" => Ok(Capability::DescribeCluster),
            _ => Err(format!("Unknown capability: {}", s)),
        }
    }
}

/// A declared grant: `principal` may exercise `capability` on `resource`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Grant {
    pub principal: String,
    pub resource: String,
    pub capability: Capability,
}

impl Grant {
    pub fn new(
        principal: impl Into<String>,
        resource: impl Into<String>,
        capability: Capability,
    ) -> Self {
        Self {
            principal: principal.into(),
            resource: resource.into(),
            capability,
        }
    }
}

impl std::fmt::Display for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} on {}",
            self.principal, self.capability, self.resource
        )
    }
}

/// A grant with both sides resolved, as handed to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct GrantRequest<'a> {
    pub grant: &'a Grant,
    pub principal_outputs: &'a Outputs,
    pub resource_outputs: &'a Outputs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_targets() {
        assert_eq!(Capability::PullPush.target_kind(), ResourceKind::Registry);
        assert_eq!(
            Capability::ClusterAdmin.target_kind(),
            ResourceKind::ComputeCluster
        );
    }

    #[test]
    fn test_capability_parse() {
        assert_eq!(
            "describe-cluster".parse::<Capability>().unwrap(),
            Capability::DescribeCluster
        );
        assert!("admin".parse::<Capability>().is_err());
    }
}
