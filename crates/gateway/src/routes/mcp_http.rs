//! Streamable-HTTP MCP endpoints
//!
//! The preferred single-endpoint transport: `POST/GET/DELETE /{ns}/mcp`.
//! The first POST (no `mcp-session-id`) creates the session and returns its
//! id in the response header; every later exchange must present it and is
//! checked against the owning API key and namespace.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{sse::Event, IntoResponse, Response, Sse},
};
use futures::stream;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::session::{Session, SessionTransport};
use crate::state::AppState;

use super::{authenticate, parse_namespace, Caller};

const SESSION_HEADER: &str = "mcp-session-id";

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn include_inactive(query: &HashMap<String, String>) -> bool {
    query
        .get("includeInactiveServers")
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Look up a session and enforce strict (api_key, namespace) ownership
async fn owned_session(
    state: &AppState,
    raw_session_id: &str,
    caller: &Caller,
    namespace: metamcp_shared::NamespaceId,
) -> ApiResult<Arc<Session>> {
    let session_id: Uuid = raw_session_id
        .parse()
        .map_err(|_| ApiError::SessionUnknown(raw_session_id.to_string()))?;

    let session = state
        .sessions
        .get(session_id)
        .await
        .ok_or_else(|| ApiError::SessionUnknown(raw_session_id.to_string()))?;

    if session.api_key != caller.api_key {
        tracing::warn!(
            session_id = %session_id,
            api_key_uuid = %caller.key_id,
            "session access with mismatched API key"
        );
        return Err(ApiError::SessionMismatch);
    }
    if session.namespace_id != namespace {
        return Err(ApiError::SessionUnknown(raw_session_id.to_string()));
    }

    session.touch().await;
    Ok(session)
}

fn parse_request(body: &Bytes) -> Result<JsonRpcRequest, Response> {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(e) => {
            return Err(rpc_error_response(
                None,
                JsonRpcError::parse_error(format!("Invalid UTF-8: {}", e)),
                StatusCode::BAD_REQUEST,
            ));
        }
    };

    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            return Err(rpc_error_response(
                None,
                JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
                StatusCode::BAD_REQUEST,
            ));
        }
    };

    if request.jsonrpc != "2.0" {
        return Err(rpc_error_response(
            request.id,
            JsonRpcError::invalid_request("Invalid JSON-RPC version, expected 2.0"),
            StatusCode::BAD_REQUEST,
        ));
    }

    Ok(request)
}

/// JSON-RPC responses ride HTTP 200; resource exhaustion is the exception
fn respond(response: JsonRpcResponse, session_id: Uuid) -> Response {
    let status = match &response.error {
        Some(e) if e.code == JsonRpcError::RESOURCE_LIMIT => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    let mut http = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&response).unwrap_or_default(),
    )
        .into_response();

    if let Ok(value) = session_id.to_string().parse() {
        http.headers_mut().insert(SESSION_HEADER, value);
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        if let Ok(value) = "5".parse() {
            http.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    http
}

fn rpc_error_response(
    id: Option<crate::mcp::types::JsonRpcId>,
    error: JsonRpcError,
    status: StatusCode,
) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&JsonRpcResponse::error(id, error)).unwrap_or_default(),
    )
        .into_response()
}

/// `POST /{namespace}/mcp`
pub async fn handle_post(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };
    let namespace = match parse_namespace(&namespace) {
        Ok(ns) => ns,
        Err(e) => return e.into_response(),
    };

    let request = match parse_request(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let session = match session_id_from(&headers) {
        Some(raw) => match owned_session(&state, &raw, &caller, namespace).await {
            Ok(session) => session,
            Err(e) => return e.into_response(),
        },
        None => {
            // First exchange: mint the session before processing
            let instance = Arc::new(state.factory.create(
                namespace,
                caller.api_key.clone(),
                caller.key_id,
                caller.user_id,
                include_inactive(&query),
            ));
            let session = Arc::new(Session::new(
                namespace,
                caller.api_key.clone(),
                caller.key_id,
                SessionTransport::StreamableHttp,
                instance,
            ));
            state.sessions.insert(Arc::clone(&session)).await;
            tracing::info!(
                session_id = %session.id,
                namespace = %namespace,
                api_key_uuid = %caller.key_id,
                "session created"
            );
            session
        }
    };

    if request.is_notification() {
        session.instance.handle(request).await;
        let mut response = StatusCode::ACCEPTED.into_response();
        if let Ok(value) = session.id.to_string().parse() {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        return response;
    }

    let is_initialize = request.method == "initialize";
    let response = session.instance.handle(request).await;
    if is_initialize && response.error.is_none() {
        session.mark_ready().await;
    }

    respond(response, session.id)
}

/// `GET /{namespace}/mcp` — the server-initiated event stream
pub async fn handle_get(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };
    let namespace = match parse_namespace(&namespace) {
        Ok(ns) => ns,
        Err(e) => return e.into_response(),
    };
    let Some(raw) = session_id_from(&headers) else {
        return ApiError::SessionRequired.into_response();
    };
    let session = match owned_session(&state, &raw, &caller, namespace).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    // The gateway emits no unsolicited events; the stream stays open on
    // keep-alives until the client drops it.
    let stream = stream::pending::<Result<Event, Infallible>>();
    let mut response = Sse::new(stream)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response();
    if let Ok(value) = session.id.to_string().parse() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// `DELETE /{namespace}/mcp` — one session with the header, all of the
/// caller's sessions without it
pub async fn handle_delete(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };
    let namespace = match parse_namespace(&namespace) {
        Ok(ns) => ns,
        Err(e) => return e.into_response(),
    };

    match session_id_from(&headers) {
        Some(raw) => {
            let session = match owned_session(&state, &raw, &caller, namespace).await {
                Ok(session) => session,
                Err(e) => return e.into_response(),
            };
            state.sessions.remove(session.id).await;
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({"closed": 1})),
            )
                .into_response()
        }
        None => {
            let closed = state.sessions.remove_all_for_key(&caller.api_key).await;
            // Bulk delete also tears down the caller's upstream bucket
            state.pool.cleanup_api_key(&caller.api_key).await;
            tracing::info!(
                api_key_uuid = %caller.key_id,
                closed = closed,
                "all sessions closed for API key"
            );
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({"closed": closed})),
            )
                .into_response()
        }
    }
}
