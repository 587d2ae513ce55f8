//! API error types with HTTP status mapping.

use crate::error::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found (404).
    NotFound(String),
    /// Conflict - resource already exists or is locked (409).
    Conflict(String),
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// Request timeout (408).
    Timeout,
    /// Internal server error (500).
    Internal(String),
    /// Engine failure, reported with its dispatch code.
    Dispatch(Error),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

/// HTTP status for an engine error.
fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::VmNotFound(_) | Error::SnapshotNotFound { .. } => StatusCode::NOT_FOUND,
        Error::VmLocked { .. }
        | Error::SnapshotLocked { .. }
        | Error::NotLockOwner { .. }
        | Error::NotRegistered { .. }
        | Error::AlreadyRegistered { .. }
        | Error::AlreadyExists { .. }
        | Error::VmConfigAlreadyExists { .. } => StatusCode::CONFLICT,
        Error::AccessDenied { .. }
        | Error::AccessToVmHddDenied { .. }
        | Error::AccessToCloneDeviceDenied { .. }
        | Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        Error::VmNameEmpty
        | Error::HddImageCloneToSelf { .. }
        | Error::ChangeSidNotSupported { .. }
        | Error::ChangeSidGuestToolsNotAvailable { .. }
        | Error::SnapshotsNotAllowedForBootcamp { .. } => StatusCode::BAD_REQUEST,
        Error::NotEnoughSpaceForSnapshot { .. } | Error::NotEnoughSpaceForClone { .. } => {
            StatusCode::INSUFFICIENT_STORAGE
        }
        e if e.is_cancellation() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND".to_string(), msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT".to_string(), msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST".to_string(), msg),
            ApiError::Timeout => (
                StatusCode::REQUEST_TIMEOUT,
                "TIMEOUT".to_string(),
                "request timed out".to_string(),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR".to_string(),
                msg,
            ),
            ApiError::Dispatch(err) => (status_of(&err), err.code(), err.to_string()),
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Dispatch(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}
