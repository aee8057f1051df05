//! Error types for keyrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::types::Provider;

/// Result type alias for keyrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for keyrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No enabled load balancer config for model '{model}'")]
    ConfigNotFound { model: String },

    #[error("Model '{model}' has {available} healthy keys, {required} required")]
    InsufficientHealthyProviders {
        model: String,
        available: usize,
        required: usize,
    },

    #[error("No key available for provider '{provider}'")]
    NoKeyAvailable { provider: Provider },

    #[error("All providers exhausted for model '{model}'")]
    AllProvidersExhausted { model: String },

    #[error("Usage quota exceeded for user {user_id}")]
    QuotaExceeded { user_id: i64 },

    #[error("This API key has already been donated")]
    DuplicateKey,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ConfigNotFound { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InsufficientHealthyProviders { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::NoKeyAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::AllProvidersExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::DuplicateKey => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        // OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": "keyrelay_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
