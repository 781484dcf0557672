//! Error types for StoreSage services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for planning and execution failure modes
//! - A turn-level error kind used by the orchestrator state machine
//! - HTTP status code mapping
//! - Structured error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidFormat,

    // Understanding errors (2xxx)
    IntentUnresolved,
    AmbiguousInvocation,
    AmbiguousEntity,
    EntityNotFound,

    // Planning errors (3xxx)
    SchemaMismatch,

    // Rate limiting (6xxx)
    RateLimited,

    // Database errors (7xxx)
    DatabaseError,

    // External service errors (8xxx)
    ExecutionFailed,
    UpstreamError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidFormat => 1002,

            ErrorCode::IntentUnresolved => 2001,
            ErrorCode::AmbiguousInvocation => 2002,
            ErrorCode::AmbiguousEntity => 2003,
            ErrorCode::EntityNotFound => 2004,

            ErrorCode::SchemaMismatch => 3001,

            ErrorCode::RateLimited => 6001,

            ErrorCode::DatabaseError => 7001,

            ErrorCode::ExecutionFailed => 8001,
            ErrorCode::UpstreamError => 8002,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Turn-level error kind carried by the orchestrator's `Errored` state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IntentUnresolved,
    SchemaMismatch,
    AmbiguousInvocation,
    AmbiguousEntity,
    EntityNotFound,
    ExecutionFailed,
    Internal,
}

impl ErrorKind {
    /// Whether the caller should answer a clarifying question
    pub fn needs_clarification(&self) -> bool {
        matches!(
            self,
            ErrorKind::IntentUnresolved
                | ErrorKind::AmbiguousInvocation
                | ErrorKind::AmbiguousEntity
                | ErrorKind::EntityNotFound
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IntentUnresolved => "intent_unresolved",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::AmbiguousInvocation => "ambiguous_invocation",
            ErrorKind::AmbiguousEntity => "ambiguous_entity",
            ErrorKind::EntityNotFound => "entity_not_found",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Understanding errors
    #[error("Could not understand the question: {reason}")]
    IntentUnresolved { reason: String },

    #[error("Ambiguous model request: {message}")]
    AmbiguousInvocation { message: String },

    #[error("'{reference}' matches several entities: {}", .candidates.join(", "))]
    AmbiguousEntity {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("No entity matches '{reference}'")]
    EntityNotFound { reference: String },

    // Planning errors
    #[error("Schema mismatch: {table}.{column} is not in the catalog")]
    SchemaMismatch { table: String, column: String },

    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // External service errors
    #[error("{component} failed: {message}")]
    ExecutionFailed { component: String, message: String },

    #[error("{component} timed out after {timeout_ms}ms")]
    Timeout { component: String, timeout_ms: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for an external call failure
    pub fn execution(component: impl Into<String>, message: impl fmt::Display) -> Self {
        AppError::ExecutionFailed {
            component: component.into(),
            message: message.to_string(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::IntentUnresolved { .. } => ErrorCode::IntentUnresolved,
            AppError::AmbiguousInvocation { .. } => ErrorCode::AmbiguousInvocation,
            AppError::AmbiguousEntity { .. } => ErrorCode::AmbiguousEntity,
            AppError::EntityNotFound { .. } => ErrorCode::EntityNotFound,
            AppError::SchemaMismatch { .. } => ErrorCode::SchemaMismatch,
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::ExecutionFailed { .. } | AppError::Timeout { .. } => {
                ErrorCode::ExecutionFailed
            }
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Map to the turn-level error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::IntentUnresolved { .. } => ErrorKind::IntentUnresolved,
            AppError::AmbiguousInvocation { .. } => ErrorKind::AmbiguousInvocation,
            AppError::AmbiguousEntity { .. } => ErrorKind::AmbiguousEntity,
            AppError::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            AppError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            AppError::ExecutionFailed { .. }
            | AppError::Timeout { .. }
            | AppError::Database(_)
            | AppError::HttpClient(_) => ErrorKind::ExecutionFailed,
            _ => ErrorKind::Internal,
        }
    }

    /// Failures worth one more attempt on an idempotent call
    ///
    /// Only timeouts and connection-level faults qualify; an upstream that
    /// answered with an error will answer the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Timeout { .. } => true,
            AppError::HttpClient(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Clarification candidates, if any
    pub fn candidates(&self) -> &[String] {
        match self {
            AppError::AmbiguousEntity { candidates, .. } => candidates,
            _ => &[],
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } | AppError::InvalidFormat { .. } => {
                StatusCode::BAD_REQUEST
            }

            // 422 Unprocessable: the caller has to rephrase or pick a candidate
            AppError::IntentUnresolved { .. }
            | AppError::AmbiguousInvocation { .. }
            | AppError::AmbiguousEntity { .. }
            | AppError::EntityNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::SchemaMismatch { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::ExecutionFailed { .. }
            | AppError::Database(_)
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::AmbiguousEntity { candidates, .. } => {
                Some(serde_json::json!({ "candidates": candidates }))
            }
            AppError::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({ "field": field })),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}
