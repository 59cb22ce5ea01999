// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use copyrem_server_jobs::RegistryError;
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job not ready: {0}")]
    Conflict(String),

    #[error("Too many requests")]
    AdmissionRejected,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Map a registry failure for job `id`.
    pub fn from_registry(id: &str, err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => Self::NotFound(id.to_string()),
            RegistryError::Conflict => Self::Conflict(id.to_string()),
            RegistryError::Io(e) => Self::Internal(format!("job {id}: {e}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::NotFound(id) => {
                tracing::debug!(job_id = %id, "Job not found");
                (StatusCode::NOT_FOUND, ErrorResponse::new("job not found"))
            }
            ApiError::Conflict(id) => {
                tracing::debug!(job_id = %id, "Job not ready");
                (StatusCode::CONFLICT, ErrorResponse::new("job not ready"))
            }
            ApiError::AdmissionRejected => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::with_details("Too many requests", "try again later"),
            ),
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::PayloadTooLarge(msg) => {
                tracing::warn!(message = %msg, "Payload too large");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    ErrorResponse::with_details("Payload too large", msg.clone()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
