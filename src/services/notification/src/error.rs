//! Error handling for the notification service
//!
//! Every fallible operation in the dispatch engine returns [`NotificationError`].
//! Per-recipient delivery failures never surface here: they are recorded as
//! delivery log rows by the tracker instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use edu_core_shared::types::{ChannelKind, NotificationStatus};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for notification service operations
pub type Result<T> = std::result::Result<T, NotificationError>;

/// Main error type for the notification service
#[derive(Error, Debug)]
pub enum NotificationError {
    /// Database-related errors
    #[error("Database error: {message}")]
    Database { message: String },

    /// Job queue / broker errors
    #[error("Queue error: {message}")]
    Queue { message: String },

    /// A channel adapter rejected a delivery
    #[error("{channel} channel error: {message}")]
    Channel { channel: ChannelKind, message: String },

    /// Template processing errors
    #[error("Template error: {message}")]
    Template { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Conflict errors (e.g. cancelling a notification that already left SCHEDULED)
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Reprocessing guard: the notification already left PENDING/SCHEDULED
    #[error("Notification {id} is not processable in status {status}")]
    NotProcessable { id: Uuid, status: NotificationStatus },

    /// A stored targeting mode that this build does not understand
    #[error("Invalid target type: {value}")]
    InvalidTargetType { value: String },

    /// The notification's expiry passed before it could be dispatched
    #[error("Notification {id} expired before dispatch")]
    Expired { id: Uuid },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Network/connection errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// External service errors
    #[error("External service error: {service}: {message}")]
    ExternalService { service: String, message: String },

    /// Internal service errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Service unavailable errors
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },
}

impl NotificationError {
    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotificationError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Queue { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Channel { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Template { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotificationError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Validation { .. } => StatusCode::BAD_REQUEST,
            NotificationError::NotFound { .. } => StatusCode::NOT_FOUND,
            NotificationError::Conflict { .. } => StatusCode::CONFLICT,
            NotificationError::NotProcessable { .. } => StatusCode::CONFLICT,
            NotificationError::InvalidTargetType { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotificationError::Expired { .. } => StatusCode::GONE,
            NotificationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            NotificationError::Network { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Serialization { .. } => StatusCode::BAD_REQUEST,
            NotificationError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            NotificationError::Database { .. } => "DATABASE_ERROR",
            NotificationError::Queue { .. } => "QUEUE_ERROR",
            NotificationError::Channel { .. } => "CHANNEL_ERROR",
            NotificationError::Template { .. } => "TEMPLATE_ERROR",
            NotificationError::Config { .. } => "CONFIG_ERROR",
            NotificationError::Validation { .. } => "VALIDATION_ERROR",
            NotificationError::NotFound { .. } => "NOT_FOUND",
            NotificationError::Conflict { .. } => "CONFLICT",
            NotificationError::NotProcessable { .. } => "NOT_PROCESSABLE",
            NotificationError::InvalidTargetType { .. } => "INVALID_TARGET_TYPE",
            NotificationError::Expired { .. } => "EXPIRED",
            NotificationError::Timeout { .. } => "TIMEOUT",
            NotificationError::Network { .. } => "NETWORK_ERROR",
            NotificationError::Serialization { .. } => "SERIALIZATION_ERROR",
            NotificationError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            NotificationError::Internal { .. } => "INTERNAL_ERROR",
            NotificationError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }

    /// Whether the queue worker should retry the job that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Database { .. } => true,
            NotificationError::Queue { .. } => true,
            NotificationError::Channel { .. } => true,
            NotificationError::Template { .. } => false,
            NotificationError::Config { .. } => false,
            NotificationError::Validation { .. } => false,
            NotificationError::NotFound { .. } => false,
            NotificationError::Conflict { .. } => false,
            NotificationError::NotProcessable { .. } => false,
            NotificationError::InvalidTargetType { .. } => false,
            NotificationError::Expired { .. } => false,
            NotificationError::Timeout { .. } => true,
            NotificationError::Network { .. } => true,
            NotificationError::Serialization { .. } => false,
            NotificationError::ExternalService { .. } => true,
            NotificationError::Internal { .. } => true,
            NotificationError::ServiceUnavailable { .. } => true,
        }
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

// Conversion implementations for external error types

impl From<sqlx::Error> for NotificationError {
    fn from(err: sqlx::Error) -> Self {
        NotificationError::Database {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for NotificationError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        NotificationError::Database {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Queue {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "email")]
impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::Channel {
            channel: ChannelKind::Email,
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "email")]
impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::Channel {
            channel: ChannelKind::Email,
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NotificationError::Timeout {
                operation: "HTTP request".to_string(),
            }
        } else if err.is_connect() {
            NotificationError::Network {
                message: err.to_string(),
            }
        } else {
            NotificationError::ExternalService {
                service: "HTTP".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::RenderError> for NotificationError {
    fn from(err: handlebars::RenderError) -> Self {
        NotificationError::Template {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::TemplateError> for NotificationError {
    fn from(err: handlebars::TemplateError) -> Self {
        NotificationError::Template {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for NotificationError {
    fn from(err: config::ConfigError) -> Self {
        NotificationError::Config {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for NotificationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NotificationError::Timeout {
            operation: err.to_string(),
        }
    }
}

impl From<edu_core_shared::types::ParseEnumError> for NotificationError {
    fn from(err: edu_core_shared::types::ParseEnumError) -> Self {
        if err.kind == "target type" {
            NotificationError::InvalidTargetType { value: err.value }
        } else {
            NotificationError::Serialization {
                message: err.to_string(),
            }
        }
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field_errors = err.field_errors();
        let mut fields: Vec<&str> = field_errors.keys().copied().collect();
        fields.sort_unstable();

        let message = fields
            .iter()
            .map(|field| {
                let messages: Vec<String> = field_errors[field]
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "invalid value".to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        let field = match fields.as_slice() {
            [single] => single.to_string(),
            _ => "multiple".to_string(),
        };

        NotificationError::Validation { field, message }
    }
}

// Utility functions for creating specific error types

impl NotificationError {
    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    pub fn channel<S: Into<String>>(channel: ChannelKind, message: S) -> Self {
        Self::Channel {
            channel,
            message: message.into(),
        }
    }

    pub fn template<S: Into<String>>(message: S) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn not_processable(id: Uuid, status: NotificationStatus) -> Self {
        Self::NotProcessable { id, status }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn external_service<S1: Into<String>, S2: Into<String>>(service: S1, message: S2) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn service_unavailable<S: Into<String>>(service: S) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
        }
    }
}
