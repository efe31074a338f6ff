//! Standardized error handling for API responses
//!
//! Maps the domain error taxonomy onto consistent JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Standard API error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: u16,

    /// Error code for programmatic handling
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional detailed error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Timestamp when error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// API error types with standardized responses
#[derive(Debug)]
pub enum ApiError {
    /// 500 Internal Server Error
    Internal(String),

    /// 404 Not Found
    NotFound(String),

    /// 401 Unauthorized
    AuthenticationFailed,

    /// 403 Forbidden
    Forbidden(String),

    /// 400 Bad Request
    BadRequest(String),

    /// 409 Conflict
    Conflict(String),

    /// 422 Unprocessable Entity
    ValidationError(String),

    /// 503 Service Unavailable
    ServiceUnavailable(String),

    /// 504 Gateway Timeout
    Timeout(String),
}

impl ApiError {
    /// Convert error to ErrorResponse
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                ErrorResponse::new(500, "INTERNAL_ERROR", "An internal server error occurred")
                    .with_details(msg)
            }
            ApiError::NotFound(msg) => ErrorResponse::new(404, "NOT_FOUND", msg),
            ApiError::AuthenticationFailed => ErrorResponse::new(
                401,
                "AUTHENTICATION_FAILED",
                "Authentication credentials are invalid or missing",
            ),
            ApiError::Forbidden(msg) => ErrorResponse::new(403, "FORBIDDEN", msg),
            ApiError::BadRequest(msg) => ErrorResponse::new(400, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => ErrorResponse::new(409, "CONFLICT", msg),
            ApiError::ValidationError(msg) => ErrorResponse::new(422, "VALIDATION_ERROR", msg),
            ApiError::ServiceUnavailable(msg) => {
                ErrorResponse::new(503, "SERVICE_UNAVAILABLE", msg)
            }
            ApiError::Timeout(msg) => ErrorResponse::new(504, "TIMEOUT", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_response = self.to_error_response();
        let status_code = StatusCode::from_u16(error_response.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status_code, Json(error_response)).into_response()
    }
}

impl From<transdock_common::Error> for ApiError {
    fn from(err: transdock_common::Error) -> Self {
        use transdock_common::Error;
        match err {
            Error::Validation { field, reason } => {
                ApiError::ValidationError(format!("{}: {}", field, reason))
            }
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::AlreadyExists(msg) => ApiError::Conflict(format!("{} already exists", msg)),
            Error::Operation(msg) => ApiError::Internal(msg),
            Error::Parse(msg) => ApiError::Internal(format!("output parse error: {}", msg)),
            Error::Remote { host, message, .. } => {
                ApiError::Internal(format!("remote error on {}: {}", host, message))
            }
            Error::Timeout(msg) => ApiError::Timeout(msg),
            Error::Cancelled(msg) => ApiError::Conflict(format!("operation cancelled: {}", msg)),
            Error::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            Error::Unexpected { code, message } => {
                ApiError::Internal(format!("[{}] {}", code, message))
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        error!("Database error: {}", err);
        ApiError::Internal("Database error occurred".to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("Invalid JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_creation() {
        let error = ErrorResponse::new(404, "NOT_FOUND", "Migration not found");
        assert_eq!(error.status, 404);
        assert_eq!(error.error, "NOT_FOUND");
        assert!(error.details.is_none());
    }

    #[test]
    fn test_domain_error_mapping() {
        let err = transdock_common::Error::NotFound("tank/data@snap1".to_string());
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 404);

        let err = transdock_common::Error::validation("port", "must be between 1 and 65535");
        let api_err: ApiError = err.into();
        let response = api_err.to_error_response();
        assert_eq!(response.status, 422);
        assert!(response.message.contains("port"));

        let err = transdock_common::Error::AlreadyExists("tank/data".to_string());
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 409);

        let err = transdock_common::Error::Timeout("zfs send".to_string());
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 504);

        let err = transdock_common::Error::Unavailable("zfs not installed".to_string());
        let api_err: ApiError = err.into();
        assert_eq!(api_err.to_error_response().status, 503);
    }

    #[test]
    fn test_remote_error_keeps_host_in_details() {
        let err = transdock_common::Error::Remote {
            host: "host2".to_string(),
            exit_code: Some(255),
            message: "connection refused".to_string(),
        };
        let api_err: ApiError = err.into();
        let response = api_err.to_error_response();
        assert_eq!(response.status, 500);
        assert!(response.details.unwrap_or_default().contains("host2"));
    }

    #[test]
    fn test_json_serialization() {
        let error = ErrorResponse::new(400, "BAD_REQUEST", "Invalid input");
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("BAD_REQUEST"));
        assert!(json.contains("Invalid input"));
    }
}
