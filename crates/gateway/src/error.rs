//! HTTP-level error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Router-level error type. MCP-level failures never reach this; they stay
/// inside the JSON-RPC channel.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing API key")]
    AuthMissing,
    #[error("Invalid API key")]
    AuthInvalid,
    #[error("Session owned by a different API key")]
    SessionMismatch,
    #[error("Unknown session: {0}")]
    SessionUnknown(String),
    #[error("Missing session id")]
    SessionRequired,
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Resource limit reached")]
    ResourceLimit,
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::AuthMissing => (StatusCode::UNAUTHORIZED, "AUTH_MISSING", self.to_string()),
            ApiError::AuthInvalid => (StatusCode::UNAUTHORIZED, "AUTH_INVALID", self.to_string()),
            ApiError::SessionMismatch => (StatusCode::FORBIDDEN, "SESSION_MISMATCH", self.to_string()),
            ApiError::SessionUnknown(_) => (StatusCode::NOT_FOUND, "SESSION_UNKNOWN", self.to_string()),
            ApiError::SessionRequired => (StatusCode::BAD_REQUEST, "SESSION_REQUIRED", self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::ResourceLimit => (StatusCode::SERVICE_UNAVAILABLE, "RESOURCE_LIMIT", self.to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        let mut response = (status, body).into_response();

        // Echo the unknown session id so clients can drop stale state
        if let ApiError::SessionUnknown(session_id) = self {
            if let Ok(value) = session_id.parse() {
                response.headers_mut().insert("mcp-session-id", value);
            }
        }
        response
    }
}

/// Result type alias for router handlers
pub type ApiResult<T> = Result<T, ApiError>;
