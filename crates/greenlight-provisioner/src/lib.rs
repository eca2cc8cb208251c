//! Resource provisioning for Greenlight.
//!
//! The graph builder orders declared resources, the provisioner walks that
//! order through a [`Provider`](greenlight_core::provider::Provider), and the
//! access binder applies grants as their principals come up.

pub mod access;
pub mod graph;
pub mod provisioner;
pub mod simulated;
pub mod state;

pub use access::{AccessBinder, GrantError};
pub use graph::{GraphBuilder, GraphError, ProvisionPlan};
pub use provisioner::{
    ProvisionEvent, ProvisionReport, ProvisionedResource, Provisioner, ResolvedOutput,
};
pub use simulated::{ProviderCall, SimulatedProvider};
pub use state::{StateError, StateFile};
