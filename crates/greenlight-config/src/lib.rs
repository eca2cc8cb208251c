//! KDL configuration parsing for Greenlight.
//!
//! This crate handles parsing of:
//! - Topology files (greenlight.kdl)
//! - Runtime settings
//! - Variable interpolation

pub mod error;
pub mod settings;
pub mod topology;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use settings::{ClusterBackend, ExecutorBackend, RuntimeSettings};
pub use topology::{StackOutput, Topology, parse_topology};
pub use variables::{
    CommitContext, LaneContext, RESERVED_NAMESPACES, StackContext, VariableContext,
    VariableContextBuilder,
};
