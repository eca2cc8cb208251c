//! Lane status and approval decisions.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use greenlight_core::pipeline::ApprovalDecision;
use greenlight_scheduler::LaneSummary;
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_lanes))
        .route("/{lane}", get(get_lane))
        .route("/{lane}/approve", post(approve))
        .route("/{lane}/reject", post(reject))
}

/// Optional body of approve and reject requests.
#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    pub by: Option<String>,
    pub reason: Option<String>,
}

impl DecisionRequest {
    fn parse(body: &Bytes) -> Result<Self, ApiError> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))
    }
}

async fn list_lanes(State(state): State<AppState>) -> Json<Vec<LaneSummary>> {
    Json(state.orchestrator.lanes())
}

async fn get_lane(
    State(state): State<AppState>,
    Path(lane): Path<String>,
) -> Result<Json<LaneSummary>, ApiError> {
    state
        .orchestrator
        .lane(&lane)
        .map(|handle| Json(handle.summary()))
        .ok_or_else(|| ApiError::NotFound(format!("lane {} has not run", lane)))
}

async fn approve(
    State(state): State<AppState>,
    Path(lane): Path<String>,
    body: Bytes,
) -> Result<Json<LaneSummary>, ApiError> {
    let request = DecisionRequest::parse(&body)?;
    info!(lane = %lane, by = ?request.by, "Approval received");
    decide(&state, &lane, ApprovalDecision::Approved { by: request.by })
}

async fn reject(
    State(state): State<AppState>,
    Path(lane): Path<String>,
    body: Bytes,
) -> Result<Json<LaneSummary>, ApiError> {
    let request = DecisionRequest::parse(&body)?;
    info!(lane = %lane, by = ?request.by, reason = ?request.reason, "Rejection received");
    decide(
        &state,
        &lane,
        ApprovalDecision::Rejected {
            by: request.by,
            reason: request.reason,
        },
    )
}

fn decide(
    state: &AppState,
    lane: &str,
    decision: ApprovalDecision,
) -> Result<Json<LaneSummary>, ApiError> {
    state.orchestrator.decide(lane, decision)?;
    let handle = state
        .orchestrator
        .lane(lane)
        .ok_or_else(|| ApiError::NotFound(format!("lane {} has not run", lane)))?;
    Ok(Json(handle.summary()))
}
