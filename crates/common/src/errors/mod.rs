//! Error types for Minutechart services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for the tenant kernel failure modes
//!   (not configured / connect failed / execution failed)
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Prefix shown to self-service tenants when their SQL fails
pub const TENANT_EXECUTION_PREFIX: &str = "query validation failed";

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    InvalidFormat,

    // Authentication errors (2xxx)
    Unauthorized,
    InvalidToken,
    ExpiredToken,

    // Authorization errors (3xxx)
    Forbidden,
    TenantMismatch,
    AccountInactive,

    // Resource errors (4xxx)
    NotFound,
    ModuleNotFound,

    // Tenant database errors (5xxx)
    NotConfigured,
    ConnectFailed,
    ExecutionError,

    // Rate limiting (6xxx)
    RateLimited,

    // Control-plane database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::InvalidFormat => 1003,

            // Auth (2xxx)
            ErrorCode::Unauthorized => 2001,
            ErrorCode::InvalidToken => 2002,
            ErrorCode::ExpiredToken => 2003,

            // Authz (3xxx)
            ErrorCode::Forbidden => 3001,
            ErrorCode::TenantMismatch => 3002,
            ErrorCode::AccountInactive => 3003,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::ModuleNotFound => 4002,

            // Tenant database (5xxx)
            ErrorCode::NotConfigured => 5001,
            ErrorCode::ConnectFailed => 5002,
            ErrorCode::ExecutionError => 5003,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Authentication errors
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    ExpiredToken,

    // Authorization errors
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Tenant mismatch")]
    TenantMismatch,

    #[error("Account for tenant {tenant_id} is {status}")]
    AccountInactive { tenant_id: String, status: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Module not found: {id}")]
    ModuleNotFound { id: String },

    // Tenant database errors
    #[error("No database profile configured for tenant {tenant_id}")]
    NotConfigured { tenant_id: String },

    #[error("Could not connect to tenant database: {message}")]
    ConnectFailed { message: String },

    #[error("{message}")]
    Execution { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Control-plane database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for a validation failure on a named field
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::InvalidToken => ErrorCode::InvalidToken,
            AppError::ExpiredToken => ErrorCode::ExpiredToken,
            AppError::Forbidden { .. } => ErrorCode::Forbidden,
            AppError::TenantMismatch => ErrorCode::TenantMismatch,
            AppError::AccountInactive { .. } => ErrorCode::AccountInactive,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::ModuleNotFound { .. } => ErrorCode::ModuleNotFound,
            AppError::NotConfigured { .. } => ErrorCode::NotConfigured,
            AppError::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            AppError::Execution { .. } => ErrorCode::ExecutionError,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized { .. } | AppError::InvalidToken | AppError::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }

            // 403 Forbidden
            AppError::Forbidden { .. }
            | AppError::TenantMismatch
            | AppError::AccountInactive { .. } => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::NotFound { .. } | AppError::ModuleNotFound { .. } => StatusCode::NOT_FOUND,

            // 412 Precondition Failed: admin setup required
            AppError::NotConfigured { .. } => StatusCode::PRECONDITION_FAILED,

            // 422 Unprocessable Entity: the tenant's SQL failed
            AppError::Execution { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway: tenant database unreachable
            AppError::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
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

    /// Rewrite the error into the shape shown to self-service tenants.
    ///
    /// Execution failures become "query validation failed: <driver message>".
    /// Everything else passes through; admins never go through this.
    pub fn for_tenant(self) -> Self {
        match self {
            AppError::Execution { message } => AppError::Execution {
                message: format!("{}: {}", TENANT_EXECUTION_PREFIX, message),
            },
            other => other,
        }
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
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();
        let field = match &self {
            AppError::Validation { field, .. } => field.clone(),
            AppError::MissingField { field } => Some(field.clone()),
            _ => None,
        };

        // Log based on severity
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

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                field,
                request_id: None,
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

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: err.to_string(),
            field,
        }
    }
}
