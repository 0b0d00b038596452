use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Service unavailable: routing cache not ready")]
    NotReady,

    #[error("Unauthorized: invalid token")]
    Unauthorized,

    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Control plane rejected credential: {0}")]
    ControlPlaneAuth(String),

    #[error("Control plane error (http {status}, code {code}): {message}")]
    ControlPlane { status: u16, code: i64, message: String },

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidUpstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ControlPlaneAuth(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ControlPlane { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Client(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::NotReady => "CACHE_NOT_READY",
            ProxyError::Unauthorized => "INVALID_TOKEN",
            ProxyError::InvalidUpstream { .. } => "INVALID_UPSTREAM",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
            ProxyError::BadRequest(_) => "BAD_REQUEST",
            ProxyError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ProxyError::ControlPlaneAuth(_) => "CONTROL_PLANE_AUTH",
            ProxyError::ControlPlane { .. } => "CONTROL_PLANE_ERROR",
            ProxyError::Client(_) => "HTTP_CLIENT_ERROR",
            ProxyError::Config(_) => "CONFIG_ERROR",
            ProxyError::Internal(_) => "INTERNAL_ERROR",
            ProxyError::Json(_) => "JSON_ERROR",
            ProxyError::Io(_) => "IO_ERROR",
        }
    }

    /// Credential rejected by the control plane, eligible for one re-login.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ProxyError::ControlPlaneAuth(_))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        // Upstream addresses stay in the logs.
        let message = match &self {
            ProxyError::InvalidUpstream { .. } => "Internal Server Error".to_string(),
            ProxyError::Upstream(_) | ProxyError::Client(_) => "Bad Gateway: upstream request failed".to_string(),
            other => other.to_string(),
        };

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

pub type Result<T> = std::result::Result<T, ProxyError>;
