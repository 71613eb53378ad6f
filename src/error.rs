//! Error types for infergate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for infergate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for infergate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("The model '{model}' does not exist or is not served by any backend")]
    UnknownModel { model: String },

    #[error("No backend available for model '{model}'{}", last_failure_suffix(.last_failure))]
    NoBackendAvailable {
        model: String,
        last_failure: Option<String>,
    },

    #[error("All backends serving model '{model}' are rate limited, please wait")]
    RateLimited { model: String },

    #[error("Backend '{0}' not found")]
    BackendNotFound(String),

    #[error("Failed to reach backend '{backend}': {message}")]
    BackendTransport { backend: String, message: String },

    #[error("Backend '{backend}' returned {status}")]
    UpstreamStatus {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("Stream from backend '{backend}' aborted: {message}")]
    StreamAborted { backend: String, message: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn last_failure_suffix(last_failure: &Option<String>) -> String {
    match last_failure {
        Some(failure) => format!(" (last failure: {})", failure),
        None => String::new(),
    }
}

impl Error {
    /// HTTP status the caller receives for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::UnknownModel { .. } => StatusCode::NOT_FOUND,
            Error::NoBackendAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BackendNotFound(_) => StatusCode::NOT_FOUND,
            Error::BackendTransport { .. } => StatusCode::BAD_GATEWAY,
            Error::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::StreamAborted { .. } => StatusCode::BAD_GATEWAY,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error `type` string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::Internal(_) => "internal_error",
            Error::UnknownModel { .. } => "model_not_found",
            Error::NoBackendAvailable { .. } => "no_backend_available",
            Error::RateLimited { .. } => "rate_limit_exceeded",
            Error::BackendNotFound(_) => "not_found",
            Error::BackendTransport { .. } => "backend_transport_error",
            Error::UpstreamStatus { .. } => "upstream_error",
            Error::StreamAborted { .. } => "stream_aborted",
            Error::BadRequest(_) => "invalid_request_error",
        }
    }

    /// Structured error body mirroring the OpenAI error shape.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.status_code().as_u16()
            }
        })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Upstream bodies that already carry an OpenAI error object pass through untouched.
        if let Error::UpstreamStatus { body, .. } = &self {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
                if parsed.get("error").is_some() {
                    return (status, axum::Json(parsed)).into_response();
                }
            }
        }

        (status, axum::Json(self.to_body())).into_response()
    }
}
