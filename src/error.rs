use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ThrottlerError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ThrottlerError {
    /// The primary connection is not in the Ready state.
    #[error("Cluster transport unavailable")]
    TransportUnavailable,

    #[error("Cluster command timed out after {0:?}")]
    TransportTimeout(Duration),

    #[error("Cluster transport error: {0}")]
    Transport(String),

    /// Startup connect gave up after the bounded retry loop.
    #[error("Failed to connect to cluster after {attempts} attempts: {last_error}")]
    ExhaustedReconnect { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThrottlerError {
    /// Transport-level failures are absorbed at the safe-wrapper boundary.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ThrottlerError::TransportUnavailable
                | ThrottlerError::TransportTimeout(_)
                | ThrottlerError::Transport(_)
        )
    }

    /// Startup-fatal errors disable the dependent feature.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            ThrottlerError::ExhaustedReconnect { .. } | ThrottlerError::Configuration(_)
        )
    }
}

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::Transport(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::Configuration(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::TransportUnavailable
            | ThrottlerError::TransportTimeout(_)
            | ThrottlerError::Transport(_)
            | ThrottlerError::ExhaustedReconnect { .. } => {
                Self::new("service_unavailable", &message, 503)
            }
            ThrottlerError::Configuration(_) => Self::new("configuration_error", &message, 500),
            ThrottlerError::Validation(_) => Self::new("validation_error", &message, 422),
            ThrottlerError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
