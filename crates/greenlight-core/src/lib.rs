//! Core domain types and traits for the Greenlight provisioning engine.
//!
//! This crate contains:
//! - Run identifiers and the shared error type
//! - Declared resources, their inputs, outputs and provisioning state
//! - Build specifications and the build executor trait
//! - Pipelines, stages, lanes and commit events
//! - The provider, access and cluster target collaborator traits
//! - The blue/green promotion decision

pub mod access;
pub mod buildspec;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod provider;
pub mod resource;

pub use error::{Error, Result};
pub use id::RunId;
pub use resource::{InputValue, OutputRef, Outputs, ProvisioningState, Resource, ResourceKind};
