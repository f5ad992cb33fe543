//! HTTP routes
//!
//! Per-namespace MCP endpoints in both transport modalities, plus health
//! and metrics. Every MCP route requires an API key via `X-API-Key` or
//! `Authorization: Bearer`.

pub mod health;
pub mod mcp_http;
pub mod sse;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderMap},
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use metamcp_shared::{ApiKeyId, NamespaceId};

use crate::auth::{display_prefix, looks_like_key};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Create all gateway routes
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.max_request_body_bytes;

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route(
            "/:namespace/mcp",
            post(mcp_http::handle_post)
                .get(mcp_http::handle_get)
                .delete(mcp_http::handle_delete),
        )
        .route("/:namespace/sse", get(sse::handle_sse))
        .route("/:namespace/message", post(sse::handle_message))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Extract the API key from `X-API-Key` or `Authorization: Bearer …`
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }

    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(key) = auth.strip_prefix("Bearer ") {
            return Some(key.to_string());
        }
    }

    None
}

/// Authenticated caller identity
pub struct Caller {
    pub api_key: String,
    pub key_id: ApiKeyId,
    pub user_id: Option<Uuid>,
}

/// Validate the caller's API key: format check first, then repository lookup
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<Caller> {
    let api_key = extract_api_key(headers).ok_or(ApiError::AuthMissing)?;

    if !looks_like_key(&api_key) {
        tracing::debug!(key = %display_prefix(&api_key), "malformed API key rejected");
        return Err(ApiError::AuthInvalid);
    }

    let validation = state
        .repo
        .validate_api_key(&api_key)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "API key validation failed");
            ApiError::Internal
        })?;

    match validation.key_id {
        Some(key_id) if validation.valid => Ok(Caller {
            api_key,
            key_id,
            user_id: validation.user_id,
        }),
        _ => {
            tracing::debug!(key = %display_prefix(&api_key), "unknown or inactive API key");
            Err(ApiError::AuthInvalid)
        }
    }
}

/// Parse the namespace path segment
pub fn parse_namespace(raw: &str) -> ApiResult<NamespaceId> {
    raw.parse::<Uuid>()
        .map(NamespaceId)
        .map_err(|_| ApiError::BadRequest(format!("Invalid namespace id: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_from_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", "sk_mt_test123".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk_mt_test123".to_string()));
    }

    #[test]
    fn extract_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk_mt_test123".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk_mt_test123".to_string()));
    }

    #[test]
    fn extract_missing_returns_none() {
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }

    #[test]
    fn namespace_must_be_uuid() {
        assert!(parse_namespace("not-a-uuid").is_err());
        assert!(parse_namespace(&Uuid::new_v4().to_string()).is_ok());
    }
}
