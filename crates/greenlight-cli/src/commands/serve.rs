//! HTTP API command.

use super::runtime;
use anyhow::{Context, Result};
use greenlight_api::AppState;
use greenlight_config::RuntimeSettings;
use std::net::SocketAddr;

/// Provision the stack, bind triggers and serve the API until interrupted.
pub async fn serve(path: &str, settings: &RuntimeSettings) -> Result<()> {
    let addr: SocketAddr = settings
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", settings.bind))?;

    let runtime = runtime(path, settings).await?;
    let mut state = AppState::new(
        runtime.topology,
        runtime.report,
        runtime.triggers,
        runtime.orchestrator,
    );
    if let Some(secret) = &settings.webhook_secret {
        state = state.with_webhook_secret(secret.as_str());
    }

    greenlight_api::serve(state, addr).await?;
    Ok(())
}
