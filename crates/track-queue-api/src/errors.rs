//! Error types for the HTTP service

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use track_queue_core::{AdminError, ConfigError, StoreError};
use tracing::{error, warn};

/// Seconds clients are asked to wait before retrying a 503
const RETRY_AFTER_SECONDS: u64 = 5;

/// Handler errors with HTTP status code mapping
///
/// - `400 Bad Request`: the request can never succeed as sent (unknown queue
///   type, unreadable body, missing confirmation, invalid argument or batch)
/// - `503 Service Unavailable`: a store is temporarily unreachable; retry
/// - `500 Internal Server Error`: anything else
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unknown queue type '{value}'")]
    UnknownQueueType { value: String },

    #[error("Invalid request body: {message}")]
    InvalidBody { message: String },

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownQueueType { .. } | Self::InvalidBody { .. } => StatusCode::BAD_REQUEST,
            Self::Admin(AdminError::ConfirmationRequired { .. })
            | Self::Admin(AdminError::InvalidArgument { .. }) => StatusCode::BAD_REQUEST,
            Self::Admin(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Admin(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(StoreError::EmptyBatch { .. })
            | Self::Store(StoreError::InvalidPriority { .. }) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody {
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Details stay in the server log
            error!(error = %self, "Internal server error occurred");
            "Internal server error occurred. Please try again later.".to_string()
        } else {
            if status == StatusCode::SERVICE_UNAVAILABLE {
                warn!(error = %self, "Store unavailable");
            }
            self.to_string()
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            if let Ok(header_value) = RETRY_AFTER_SECONDS.to_string().parse() {
                response.headers_mut().insert("Retry-After", header_value);
            }
        }

        response
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Configuration loading failed: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Storage initialization failed: {message}")]
    Storage { message: String },
}

impl ServiceError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BindFailed { .. } => 1,
            Self::ServerFailed { .. } => 2,
            Self::Configuration(_) | Self::ConfigLoad(_) => 3,
            Self::Storage { .. } => 4,
        }
    }
}
