//! Provider trait: the control plane that materializes resources.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;
use crate::access::GrantRequest;
use crate::resource::{Outputs, ResourceKind, ResourceSpec};

/// A resource with its inputs resolved to concrete values.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRequest<'a> {
    pub name: &'a str,
    pub spec: &'a ResourceSpec,
    pub inputs: &'a BTreeMap<String, String>,
}

impl CreateRequest<'_> {
    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }
}

/// What the provider already knows about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    /// Inputs the resource was last created or updated with.
    pub inputs: BTreeMap<String, String>,
    pub outputs: Outputs,
}

/// Trait for infrastructure providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Look up an existing resource by logical name.
    async fn describe(&self, name: &str, kind: ResourceKind) -> Result<Option<ResourceRecord>>;

    /// Create a resource, returning its resolved outputs.
    async fn create(&self, request: &CreateRequest<'_>) -> Result<Outputs>;

    /// Update an existing resource whose inputs changed.
    async fn update(&self, request: &CreateRequest<'_>) -> Result<Outputs>;

    /// Bind a permission between two provisioned resources.
    async fn grant(&self, request: &GrantRequest<'_>) -> Result<()>;
}
