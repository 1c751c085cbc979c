//! API error handling.
//!
//! Maps resolve failures to HTTP responses. Bodies carry a stable code, a
//! generic message and retry hints; tool output never reaches the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{Error, ExtractionError};

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ExtractionError> for ApiError {
    fn from(err: ExtractionError) -> Self {
        let retryable = err.is_retryable();
        let code = err.code();
        match &err {
            ExtractionError::Failed { resource_id, .. } => {
                ApiError::service_unavailable(code, "Media extraction failed")
                    .with_details(serde_json::json!({
                        "resource_id": resource_id,
                        "retryable": retryable,
                    }))
            }
            ExtractionError::Timeout {
                resource_id,
                timeout_secs,
            } => ApiError::new(StatusCode::GATEWAY_TIMEOUT, code, "Media extraction timed out")
                .with_details(serde_json::json!({
                    "resource_id": resource_id,
                    "timeout_secs": timeout_secs,
                    "retryable": retryable,
                })),
            ExtractionError::Cancelled { resource_id } => {
                ApiError::service_unavailable(code, "Media extraction was interrupted")
                    .with_details(serde_json::json!({
                        "resource_id": resource_id,
                        "retryable": retryable,
                    }))
            }
            ExtractionError::CapacityExceeded {
                resource_id,
                waited_secs,
            } => ApiError::service_unavailable(code, "Too many extractions in progress")
                .with_details(serde_json::json!({
                    "resource_id": resource_id,
                    "retry_after_secs": (*waited_secs).max(1),
                    "retryable": retryable,
                })),
            ExtractionError::InvariantViolation { detail } => {
                tracing::error!(detail = %detail, "Extraction registry invariant violated");
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Extraction(e) => e.into(),
            Error::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                ApiError::internal("Service misconfigured")
            }
            _ => {
                tracing::error!("Unexpected error: {}", err);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
