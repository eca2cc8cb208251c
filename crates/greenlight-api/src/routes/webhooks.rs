//! Commit webhook.
//!
//! `POST /webhooks/commit/{repo}` with `{"commit": "<sha>", "branch": "..."}`
//! publishes the commit to the trigger binder and starts every lane whose
//! source stage watches the repository.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use greenlight_core::ResourceKind;
use greenlight_core::pipeline::{CommitEvent, validate_commit_id};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub const SIGNATURE_HEADER: &str = "X-Greenlight-Signature";

pub fn router() -> Router<AppState> {
    Router::new().route("/commit/{repo}", post(commit_webhook))
}

#[derive(Debug, Deserialize)]
pub struct CommitPayload {
    pub commit: String,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LaneDispatch {
    pub lane: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommitAccepted {
    pub repository: String,
    pub commit: String,
    /// Build jobs the commit was queued for.
    pub builds: usize,
    pub lanes: Vec<LaneDispatch>,
}

async fn commit_webhook(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<CommitAccepted>), ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!(repository = %repo, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let payload: CommitPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    if let Err(e) = validate_commit_id(&payload.commit) {
        warn!(repository = %repo, error = %e, "Rejected commit webhook");
        return Err(e.into());
    }

    match state.topology.resource(&repo).map(|r| r.kind()) {
        Some(ResourceKind::SourceRepo) => {}
        _ => {
            return Err(ApiError::NotFound(format!(
                "source repository {} is not declared",
                repo
            )));
        }
    }

    let mut event = CommitEvent::new(&repo, payload.commit);
    event.branch = payload.branch;
    info!(repository = %repo, commit = %event.short_commit(), "Received commit webhook");

    let builds = state.triggers.publish(event.clone())?;
    let lanes = state
        .orchestrator
        .start_watching(&event)
        .into_iter()
        .map(|(lane, started)| match started {
            Ok(run_id) => LaneDispatch {
                lane,
                run_id: Some(run_id.to_string()),
                error: None,
            },
            Err(e) => LaneDispatch {
                lane,
                run_id: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Ok((
        StatusCode::ACCEPTED,
        Json(CommitAccepted {
            repository: repo,
            commit: event.commit,
            builds,
            lanes,
        }),
    ))
}

/// Check a `sha256=<hex>` HMAC of the body.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// `sha256=<hex>` signature of `body`, as sent in [`SIGNATURE_HEADER`].
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let body = br#"{"commit":"abc"}"#;
        let signature = sign("s3cret", body).unwrap();
        assert!(verify_signature("s3cret", body, Some(&signature)));
        assert!(!verify_signature("other", body, Some(&signature)));
    }

    #[test]
    fn test_malformed_signatures() {
        let body = b"{}";
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("md5=abcd")));
        assert!(!verify_signature("s3cret", body, Some("sha256=not-hex")));
    }
}
