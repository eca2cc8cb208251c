//! Access binder: applies declared grants through the provider, once each.

use greenlight_core::Outputs;
use greenlight_core::access::{Grant, GrantRequest};
use greenlight_core::provider::Provider;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("grant {grant}: '{resource}' is not ready")]
    NotReady { grant: Grant, resource: String },

    #[error("grant {grant} rejected by provider: {message}")]
    Rejected { grant: Grant, message: String },
}

impl From<GrantError> for greenlight_core::Error {
    fn from(err: GrantError) -> Self {
        let message = err.to_string();
        let grant = match err {
            GrantError::NotReady { grant, .. } | GrantError::Rejected { grant, .. } => grant,
        };
        greenlight_core::Error::Grant {
            principal: grant.principal,
            resource: grant.resource,
            capability: grant.capability.to_string(),
            message,
        }
    }
}

/// Tracks applied grants so each is handed to the provider at most once.
#[derive(Debug, Default)]
pub struct AccessBinder {
    applied: BTreeSet<Grant>,
}

impl AccessBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from grants applied by an earlier run.
    pub fn with_applied(applied: impl IntoIterator<Item = Grant>) -> Self {
        Self {
            applied: applied.into_iter().collect(),
        }
    }

    /// Apply `grant`. Returns `true` when the provider was called, `false`
    /// when the grant was already in place.
    pub async fn grant(
        &mut self,
        provider: &dyn Provider,
        grant: &Grant,
        principal_outputs: &Outputs,
        resource_outputs: &Outputs,
    ) -> Result<bool, GrantError> {
        if self.applied.contains(grant) {
            debug!(grant = %grant, "Grant already applied");
            return Ok(false);
        }

        let request = GrantRequest {
            grant,
            principal_outputs,
            resource_outputs,
        };
        provider
            .grant(&request)
            .await
            .map_err(|e| GrantError::Rejected {
                grant: grant.clone(),
                message: e.to_string(),
            })?;

        info!(grant = %grant, "Grant applied");
        self.applied.insert(grant.clone());
        Ok(true)
    }

    pub fn is_applied(&self, grant: &Grant) -> bool {
        self.applied.contains(grant)
    }

    pub fn applied(&self) -> impl Iterator<Item = &Grant> {
        self.applied.iter()
    }

    pub fn into_applied(self) -> Vec<Grant> {
        self.applied.into_iter().collect()
    }
}
