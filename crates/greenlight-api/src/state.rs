//! Application state.

use greenlight_config::Topology;
use greenlight_provisioner::{ProvisionReport, ResolvedOutput};
use greenlight_scheduler::{PipelineOrchestrator, TriggerBinder};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub topology: Arc<Topology>,
    pub report: Arc<ProvisionReport>,
    pub triggers: TriggerBinder,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub outputs: Arc<Vec<ResolvedOutput>>,
    /// Secret for `X-Greenlight-Signature`; unsigned webhooks are accepted
    /// when unset.
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        topology: Arc<Topology>,
        report: Arc<ProvisionReport>,
        triggers: TriggerBinder,
        orchestrator: Arc<PipelineOrchestrator>,
    ) -> Self {
        let outputs = Arc::new(report.resolve_outputs(&topology.operator_outputs()));
        Self {
            topology,
            report,
            triggers,
            orchestrator,
            outputs,
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }
}
