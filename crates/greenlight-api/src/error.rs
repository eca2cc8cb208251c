//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use greenlight_scheduler::{ApprovalError, TriggerError};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<greenlight_core::Error> for ApiError {
    fn from(err: greenlight_core::Error) -> Self {
        match err {
            greenlight_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            greenlight_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            greenlight_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        greenlight_core::Error::from(err).into()
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        greenlight_core::Error::from(err).into()
    }
}
