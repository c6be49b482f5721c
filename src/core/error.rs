//! Error type system for the extension host
//!
//! This module provides the error taxonomy shared by every layer of the host:
//! - Load-time errors (validation, compatibility, backend instantiation)
//! - Dispatch-time errors (permissions, network, execution, timeouts)
//! - HTTP status code mapping for the control API
//! - Error responses with trace IDs
//!
//! Every variant carries an owned message so errors are `Clone`; coalesced
//! cache fetches hand the same outcome to every waiting caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Main error type for the extension host
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    // Load-time errors
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Incompatible extension: {0}")]
    CompatibilityError(String),

    #[error("Backend load failed: {0}")]
    BackendLoadError(String),

    // Dispatch-time errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Extension execution error: {0}")]
    ExecutionError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Host-side errors
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ExtensionError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ExtensionError::ValidationError(_)
            | ExtensionError::SerializationError(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            ExtensionError::PermissionDenied(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            ExtensionError::NotFound(_) => StatusCode::NOT_FOUND,

            // 408 Request Timeout
            ExtensionError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,

            // 409 Conflict
            ExtensionError::CompatibilityError(_)
            | ExtensionError::InvalidState(_) => StatusCode::CONFLICT,

            // 502 Bad Gateway
            ExtensionError::NetworkError(_) => StatusCode::BAD_GATEWAY,

            // 500 Internal Server Error
            ExtensionError::BackendLoadError(_)
            | ExtensionError::DecodeError(_)
            | ExtensionError::ExecutionError(_)
            | ExtensionError::StorageError(_)
            | ExtensionError::IoError(_)
            | ExtensionError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type name for API responses and call statistics
    pub fn error_type(&self) -> &'static str {
        match self {
            ExtensionError::ValidationError(_) => "ValidationError",
            ExtensionError::CompatibilityError(_) => "CompatibilityError",
            ExtensionError::BackendLoadError(_) => "BackendLoadError",
            ExtensionError::PermissionDenied(_) => "PermissionDenied",
            ExtensionError::NetworkError(_) => "NetworkError",
            ExtensionError::DecodeError(_) => "DecodeError",
            ExtensionError::NotFound(_) => "NotFound",
            ExtensionError::InvalidState(_) => "InvalidState",
            ExtensionError::ExecutionError(_) => "ExecutionError",
            ExtensionError::Timeout(_) => "Timeout",
            ExtensionError::StorageError(_) => "StorageError",
            ExtensionError::IoError(_) => "IoError",
            ExtensionError::SerializationError(_) => "SerializationError",
            ExtensionError::ConfigError(_) => "ConfigError",
        }
    }

    /// Check if this error is worth retrying by the caller.
    ///
    /// The runtime itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtensionError::NetworkError(_) | ExtensionError::Timeout(_)
        )
    }

    /// Whether the error is terminal for a load attempt
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            ExtensionError::ValidationError(_)
                | ExtensionError::CompatibilityError(_)
                | ExtensionError::BackendLoadError(_)
        )
    }
}

impl From<std::io::Error> for ExtensionError {
    fn from(err: std::io::Error) -> Self {
        ExtensionError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ExtensionError {
    fn from(err: serde_json::Error) -> Self {
        ExtensionError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ExtensionError {
    fn from(err: rusqlite::Error) -> Self {
        ExtensionError::StorageError(err.to_string())
    }
}

impl From<reqwest::Error> for ExtensionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExtensionError::Timeout(err.to_string())
        } else {
            ExtensionError::NetworkError(err.to_string())
        }
    }
}

/// Error response structure for API endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Unique trace ID for this error
    pub trace_id: String,
}

impl ErrorResponse {
    /// Create a new error response with a generated trace ID
    pub fn new(error: String, message: String) -> Self {
        Self {
            error,
            message,
            details: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an error response with additional details
    pub fn with_details(error: String, message: String, details: serde_json::Value) -> Self {
        Self {
            details: Some(details),
            ..Self::new(error, message)
        }
    }

    /// Create an error response from an ExtensionError
    pub fn from_error(error: &ExtensionError) -> Self {
        Self::new(error.error_type().to_string(), error.to_string())
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (trace_id: {})",
            self.error, self.message, self.trace_id
        )
    }
}

impl IntoResponse for ExtensionError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = ErrorResponse::from_error(&self);

        if status_code.is_server_error() {
            tracing::error!(
                error_type = self.error_type(),
                trace_id = %error_response.trace_id,
                status_code = %status_code,
                "Request failed: {}",
                self
            );
        } else {
            tracing::debug!(
                error_type = self.error_type(),
                trace_id = %error_response.trace_id,
                status_code = %status_code,
                "Request rejected: {}",
                self
            );
        }

        (status_code, Json(error_response)).into_response()
    }
}

/// Result type alias for operations that can fail with ExtensionError
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Context extension trait for turning foreign errors into backend load failures
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let context_str = context.into();
            ExtensionError::BackendLoadError(format!("{}: {}", context_str, e))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ExtensionError::BackendLoadError(format!("{}: {}", f(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ExtensionError::ValidationError("test".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ExtensionError::PermissionDenied("test".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ExtensionError::NotFound("test".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ExtensionError::CompatibilityError("test".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ExtensionError::NetworkError("test".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ExtensionError::BackendLoadError("test".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            ExtensionError::PermissionDenied("x".into()).error_type(),
            "PermissionDenied"
        );
        assert_eq!(
            ExtensionError::DecodeError("x".into()).error_type(),
            "DecodeError"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(ExtensionError::NetworkError("test".into()).is_retryable());
        assert!(ExtensionError::Timeout("test".into()).is_retryable());
        assert!(!ExtensionError::ValidationError("test".into()).is_retryable());
        assert!(!ExtensionError::PermissionDenied("test".into()).is_retryable());
    }

    #[test]
    fn test_load_failures() {
        assert!(ExtensionError::CompatibilityError("x".into()).is_load_failure());
        assert!(!ExtensionError::NetworkError("x".into()).is_load_failure());
    }

    #[test]
    fn test_error_response_creation() {
        let error = ExtensionError::NotFound("sample-provider".into());
        let response = ErrorResponse::from_error(&error);

        assert_eq!(response.error, "NotFound");
        assert!(response.message.contains("sample-provider"));
        assert!(!response.trace_id.is_empty());
        assert!(response.details.is_none());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result.context("Failed to read module").unwrap_err();
        assert!(matches!(err, ExtensionError::BackendLoadError(_)));
        assert!(err.to_string().contains("Failed to read module"));
        assert!(err.to_string().contains("file not found"));
    }
}
