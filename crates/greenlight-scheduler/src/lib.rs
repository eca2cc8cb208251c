//! Build triggers and pipeline lanes for Greenlight.
//!
//! The build job runner executes a build job for one commit until it succeeds,
//! the trigger binder fans commit events out to bound build jobs, and the
//! pipeline orchestrator drives each lane through its stages up to the
//! approval gate and the blue/green promotion.

pub mod orchestrator;
pub mod runner;
pub mod triggers;

#[cfg(test)]
mod fixtures;

pub use orchestrator::{
    ApprovalError, LaneHandle, LaneStart, LaneSummary, PipelineEvent, PipelineOrchestrator,
    log_events,
};
pub use runner::{BuildJobRunner, BuildRecord};
pub use triggers::{TriggerBinder, TriggerError, TriggerEvent};
