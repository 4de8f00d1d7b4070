//! Error types for warden-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use warden_engine::{GovernanceError, StorageError};

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Storage backend could not be opened
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine state could not be loaded
    #[error("Engine error: {0}")]
    Engine(#[from] GovernanceError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unparseable path or query value
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Re-resolution, id reuse or an illegal transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation disabled by configuration
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A collaborator is down; the caller may retry
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Kill-switch state could not be read
    #[error("Fail-closed: {0}")]
    FailClosed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::DependencyUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "DEPENDENCY_UNAVAILABLE")
            }
            ApiError::FailClosed(_) => (StatusCode::SERVICE_UNAVAILABLE, "FAIL_CLOSED"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl From<GovernanceError> for ApiError {
    fn from(value: GovernanceError) -> Self {
        match value {
            GovernanceError::Validation(msg) => ApiError::Validation(msg),
            GovernanceError::NotFound(msg) => ApiError::NotFound(msg),
            GovernanceError::Conflict(msg) => ApiError::Conflict(msg),
            GovernanceError::DependencyUnavailable(msg) => ApiError::DependencyUnavailable(msg),
            GovernanceError::FailClosed(msg) => ApiError::FailClosed(msg),
            GovernanceError::Storage(StorageError::Unavailable(msg)) => {
                ApiError::DependencyUnavailable(msg)
            }
            GovernanceError::Storage(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(code, error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
