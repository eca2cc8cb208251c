//! Operator outputs and provisioned resources.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use greenlight_provisioner::{ProvisionedResource, ResolvedOutput};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/outputs", get(list_outputs))
        .route("/resources", get(list_resources))
}

async fn list_outputs(State(state): State<AppState>) -> Json<Vec<ResolvedOutput>> {
    Json(state.outputs.as_ref().clone())
}

async fn list_resources(State(state): State<AppState>) -> Json<Vec<ProvisionedResource>> {
    Json(state.report.resources.clone())
}
