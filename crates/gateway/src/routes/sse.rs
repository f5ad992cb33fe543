//! Legacy SSE MCP endpoints
//!
//! Dual-endpoint transport: `GET /{ns}/sse` opens the event stream and
//! advertises the session id; `POST /{ns}/message?sessionId=…` carries the
//! client's JSON-RPC requests, whose responses flow back over the stream.
//! Closing the stream tears down just that session.

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
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::ApiError;
use crate::mcp::types::{JsonRpcError, JsonRpcResponse};
use crate::session::{Session, SessionStore, SessionTransport};
use crate::state::AppState;

use super::{authenticate, parse_namespace};

const SESSION_HEADER: &str = "mcp-session-id";
const OUTBOUND_BUFFER: usize = 32;

/// Removes the session when the SSE stream is dropped (client disconnect)
struct DisconnectGuard {
    sessions: Arc<SessionStore>,
    session_id: Uuid,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let sessions = Arc::clone(&self.sessions);
        let session_id = self.session_id;
        tokio::spawn(async move {
            if sessions.remove(session_id).await.is_some() {
                tracing::info!(session_id = %session_id, "SSE client disconnected");
            }
        });
    }
}

/// `GET /{namespace}/sse`
pub async fn handle_sse(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
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
    let include_inactive = query
        .get("includeInactiveServers")
        .map(|v| v == "true")
        .unwrap_or(false);

    let (tx, rx) = mpsc::channel::<JsonRpcResponse>(OUTBOUND_BUFFER);

    let instance = Arc::new(state.factory.create(
        namespace,
        caller.api_key.clone(),
        caller.key_id,
        caller.user_id,
        include_inactive,
    ));
    let session = Arc::new(Session::new(
        namespace,
        caller.api_key.clone(),
        caller.key_id,
        SessionTransport::Sse { outbound: tx },
        instance,
    ));
    let session_id = session.id;
    state.sessions.insert(Arc::clone(&session)).await;
    session.mark_ready().await;
    tracing::info!(
        session_id = %session_id,
        namespace = %namespace,
        api_key_uuid = %caller.key_id,
        "SSE session created"
    );

    // First frame tells the client where to POST its messages
    let endpoint = format!("/{}/message?sessionId={}", namespace, session_id);
    let endpoint_event = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });

    let guard = DisconnectGuard {
        sessions: Arc::clone(&state.sessions),
        session_id,
    };
    let messages = ReceiverStream::new(rx).map(move |response| {
        let _ = &guard;
        Ok::<_, Infallible>(
            Event::default()
                .event("message")
                .data(serde_json::to_string(&response).unwrap_or_default()),
        )
    });

    let mut response = Sse::new(endpoint_event.chain(messages))
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response();
    if let Ok(value) = session_id.to_string().parse() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

#[derive(serde::Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
}

/// `POST /{namespace}/message?sessionId=…`
pub async fn handle_message(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<MessageQuery>,
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

    let Some(session) = state.sessions.get(query.session_id).await else {
        return ApiError::SessionUnknown(query.session_id.to_string()).into_response();
    };
    if session.api_key != caller.api_key {
        tracing::warn!(
            session_id = %session.id,
            api_key_uuid = %caller.key_id,
            "message for session owned by a different API key"
        );
        return ApiError::SessionMismatch.into_response();
    }
    if session.namespace_id != namespace {
        return ApiError::SessionUnknown(query.session_id.to_string()).into_response();
    }
    session.touch().await;

    let request: crate::mcp::types::JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let response =
                JsonRpcResponse::error(None, JsonRpcError::parse_error(format!("Invalid JSON: {}", e)));
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "application/json")],
                serde_json::to_string(&response).unwrap_or_default(),
            )
                .into_response();
        }
    };

    let is_notification = request.is_notification();
    let response = session.instance.handle(request).await;

    if !is_notification {
        if let SessionTransport::Sse { ref outbound } = session.transport {
            if outbound.send(response).await.is_err() {
                tracing::warn!(session_id = %session.id, "SSE stream gone; dropping response");
            }
        }
    }

    StatusCode::ACCEPTED.into_response()
}
