//! Build execution backends for Greenlight.
//!
//! Provides executor implementations for running build jobs:
//! - Local Docker (bollard)
//! - Dry run (records invocations, runs nothing)

pub mod docker;
pub mod dry_run;

pub use docker::LocalDockerExecutor;
pub use dry_run::DryRunExecutor;
pub use greenlight_core::executor::{
    BuildExecutor, BuildInvocation, JobHandle, JobResult, JobStatus, LogLine, LogStream,
};
