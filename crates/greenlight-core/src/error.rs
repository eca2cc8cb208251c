//! Error types for Greenlight.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Cycle, unresolved reference or otherwise invalid declaration.
    /// Always reported before any resource is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provisioning of '{resource}' failed: {message}")]
    Provisioning { resource: String, message: String },

    #[error("grant of {capability} on '{resource}' to '{principal}' failed: {message}")]
    Grant {
        principal: String,
        resource: String,
        capability: String,
        message: String,
    },

    #[error("build '{job}' failed: {message}")]
    BuildExecution { job: String, message: String },

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
