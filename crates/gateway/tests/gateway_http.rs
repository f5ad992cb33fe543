//! End-to-end gateway tests over the HTTP router
//!
//! Drives the streamable-HTTP endpoints against the in-memory repository,
//! with stdio stub upstreams implemented as small shell scripts.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use metamcp_gateway::auth::generate_key;
use metamcp_gateway::cache::ToolResponseCache;
use metamcp_gateway::config::Config;
use metamcp_gateway::mcp::error_tracker::ErrorTracker;
use metamcp_gateway::mcp::pool::ConnectionPool;
use metamcp_gateway::repo::{MemoryRepository, Repository};
use metamcp_gateway::routes::create_router;
use metamcp_gateway::session::SessionStore;
use metamcp_gateway::state::AppState;

use metamcp_shared::{
    ErrorStatus, MappingStatus, McpServer, NamespaceId, ServerId, ServerParams,
};

struct TestGateway {
    router: Router,
    repo: Arc<MemoryRepository>,
    state: AppState,
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".into(),
        database_url: None,
        mcp_request_timeout_ms: 3_000,
        mcp_max_total_timeout_ms: 6_000,
        mcp_reset_timeout_on_progress: false,
        pool_max_idle_secs: 7200,
        pool_cleanup_interval_secs: 1800,
        max_connections_per_api_key: 50,
        max_global_connections: 100,
        stdio_cooldown_secs: 10,
        tool_cache_max_entries: 1000,
        tool_cache_default_ttl_secs: 300,
        tool_cache_cleanup_interval_secs: 60,
        cache_l2_url: None,
        cache_l2_token: None,
        session_max_idle_secs: 7200,
        session_cleanup_interval_secs: 1800,
        max_request_body_bytes: 1024 * 1024,
    }
}

fn make_gateway() -> TestGateway {
    let config = Arc::new(test_config());
    let repo = Arc::new(MemoryRepository::new());
    let repo_dyn: Arc<dyn Repository> = Arc::clone(&repo) as Arc<dyn Repository>;
    let tracker = Arc::new(ErrorTracker::new(
        Arc::clone(&repo_dyn),
        config.stdio_cooldown(),
    ));
    let pool = ConnectionPool::new(config.pool_config(), config.request_timeouts(), tracker);
    let cache = Arc::new(ToolResponseCache::new(config.cache_config(), None));
    let sessions = Arc::new(SessionStore::new(config.session_config()));
    let state = AppState::new(config, repo_dyn, pool, cache, sessions, None);

    TestGateway {
        router: create_router(state.clone()),
        repo,
        state,
    }
}

fn stdio_stub(script: &str) -> ServerParams {
    ServerParams::stdio("sh", vec!["-c".to_string(), script.to_string()])
}

async fn seed_server(gw: &TestGateway, ns: NamespaceId, name: &str, params: ServerParams) -> ServerId {
    let server = McpServer {
        id: ServerId::new(),
        name: name.to_string(),
        params,
        error_status: ErrorStatus::None,
    };
    let id = server.id;
    gw.repo.insert_server(server).await;
    gw.repo.map_server(ns, id, MappingStatus::Active).await;
    id
}

async fn seed_key(gw: &TestGateway) -> String {
    let (secret, _) = generate_key();
    gw.repo.insert_api_key(&secret, None).await;
    secret
}

fn rpc_post(ns: NamespaceId, key: &str, session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/{}/mcp", ns))
        .header("x-api-key", key)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "application/json, text/event-stream");
    if let Some(sid) = session {
        builder = builder.header("mcp-session-id", sid);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn initialize_body(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.to_string(),
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "t", "version": "0.1"}
        }
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Open a session via initialize, returning the assigned session id
async fn handshake(gw: &TestGateway, ns: NamespaceId, key: &str) -> String {
    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(ns, key, None, initialize_body(1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string();

    let body = body_json(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], json!("metamcp"));
    session_id
}

// =============================================================================
// Auth
// =============================================================================

#[tokio::test]
async fn missing_api_key_is_401() {
    let gw = make_gateway();
    let ns = NamespaceId::new();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/{}/mcp", ns))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(initialize_body(1).to_string()))
        .unwrap();

    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_and_unknown_keys_are_401() {
    let gw = make_gateway();
    let ns = NamespaceId::new();

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(ns, "not-a-key", None, initialize_body(1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Well-formed but not registered
    let (unknown, _) = generate_key();
    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(ns, &unknown, None, initialize_body(1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Scenario: happy streamable-HTTP handshake
// =============================================================================

#[tokio::test]
async fn handshake_then_ping() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;

    let session_id = handshake(&gw, ns, &key).await;

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": "2", "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"], json!({}));
}

// =============================================================================
// Scenario: session hijack rejected
// =============================================================================

#[tokio::test]
async fn session_reuse_by_other_key_is_403() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key_a = seed_key(&gw).await;
    let key_b = seed_key(&gw).await;

    let session_id = handshake(&gw, ns, &key_a).await;

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key_b,
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": "2", "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_session_is_404_with_echoed_id() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;
    let bogus = uuid::Uuid::new_v4().to_string();

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&bogus),
            json!({"jsonrpc": "2.0", "id": "2", "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("mcp-session-id").unwrap().to_str().unwrap(),
        bogus
    );
}

// =============================================================================
// Scenario: tool name prefixing, list/call round trip
// =============================================================================

#[tokio::test]
async fn tools_are_prefixed_and_calls_route_through() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;

    // Answers initialize, tools/list, then one tools/call
    let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"file-ops","version":"0"}}}'
read notif
read list
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"read_file","description":"Read a file","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}}]}}'
read call
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"file contents"}],"isError":false}}'
sleep 30
"#;
    seed_server(&gw, ns, "File Ops", stdio_stub(script)).await;

    let session_id = handshake(&gw, ns, &key).await;

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": "2", "method": "tools/list"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let tools = body["result"]["tools"].as_array().expect("tools array");
    assert!(tools
        .iter()
        .any(|t| t["name"] == json!("File_Ops__read_file")));

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&session_id),
            json!({
                "jsonrpc": "2.0",
                "id": "3",
                "method": "tools/call",
                "params": {"name": "File_Ops__read_file", "arguments": {"path": "/tmp/x"}}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["result"]["content"][0]["text"],
        json!("file contents")
    );
    assert_eq!(body["result"]["isError"], json!(false));

    gw.state.pool.cleanup_all().await;
}

#[tokio::test]
async fn call_without_separator_is_an_mcp_error() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;
    let session_id = handshake(&gw, ns, &key).await;

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&session_id),
            json!({
                "jsonrpc": "2.0",
                "id": "2",
                "method": "tools/call",
                "params": {"name": "read_file", "arguments": {}}
            }),
        ))
        .await
        .unwrap();

    // MCP error shape over HTTP 200, never a transport failure
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Invalid tool name"));
}

// =============================================================================
// Scenario: cache short-circuit
// =============================================================================

#[tokio::test]
async fn second_identical_call_is_served_from_cache() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;

    // Answers exactly ONE tools/call, then goes quiet: a second upstream
    // request would time out rather than answer.
    let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"docs","version":"0"}}}'
read notif
read call
echo '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"SELECT syntax..."}],"isError":false}}'
sleep 60
"#;
    seed_server(&gw, ns, "Docs", stdio_stub(script)).await;

    let session_id = handshake(&gw, ns, &key).await;
    let call = json!({
        "jsonrpc": "2.0",
        "id": "2",
        "method": "tools/call",
        "params": {"name": "Docs__sql_reference", "arguments": {"topic": "select"}}
    });

    let first = gw
        .router
        .clone()
        .oneshot(rpc_post(ns, &key, Some(&session_id), call.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["result"]["isError"], json!(false));

    // Identical args, same session: must not reach the upstream again
    let second = gw
        .router
        .clone()
        .oneshot(rpc_post(ns, &key, Some(&session_id), call))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(second_body["result"], first_body["result"]);

    gw.state.pool.cleanup_all().await;
}

// =============================================================================
// Scenario: crash, error state, cooldown
// =============================================================================

#[tokio::test]
async fn crash_marks_error_state_and_later_calls_short_circuit() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;

    // Dies on the first tools/call without answering
    let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"crashy","version":"0"}}}'
read notif
read call
exit 1
"#;
    let server_id = seed_server(&gw, ns, "Crashy", stdio_stub(script)).await;

    let session_id = handshake(&gw, ns, &key).await;

    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&session_id),
            json!({
                "jsonrpc": "2.0",
                "id": "2",
                "method": "tools/call",
                "params": {"name": "Crashy__do_work", "arguments": {}}
            }),
        ))
        .await
        .unwrap();

    // The failed call surfaces as an in-band tool error, not HTTP 500
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["isError"], json!(true));

    // Crash callback persists ERROR asynchronously
    let mut marked = false;
    for _ in 0..50 {
        let server = gw.repo.find_server(server_id).await.unwrap().unwrap();
        if server.error_status == ErrorStatus::Error {
            marked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(marked, "crash must mark the server ERROR");

    // Subsequent calls short-circuit with the canonical message
    let response = gw
        .router
        .clone()
        .oneshot(rpc_post(
            ns,
            &key,
            Some(&session_id),
            json!({
                "jsonrpc": "2.0",
                "id": "3",
                "method": "tools/call",
                "params": {"name": "Crashy__do_work", "arguments": {}}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["isError"], json!(true));
    assert!(body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("server in error state"));
}

// =============================================================================
// Scenario: DELETE closes sessions
// =============================================================================

#[tokio::test]
async fn delete_without_session_id_closes_all_of_the_keys_sessions() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;

    let first = handshake(&gw, ns, &key).await;
    let second = handshake(&gw, ns, &key).await;
    assert_ne!(first, second);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/{}/mcp", ns))
        .header("x-api-key", &key)
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["closed"], json!(2));

    // Both old session ids are gone
    for sid in [&first, &second] {
        let response = gw
            .router
            .clone()
            .oneshot(rpc_post(
                ns,
                &key,
                Some(sid),
                json!({"jsonrpc": "2.0", "id": "9", "method": "ping"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // The key's upstream bucket went with them
    assert_eq!(gw.state.pool.status().await.buckets, 0);
}

#[tokio::test]
async fn delete_with_session_id_closes_only_that_session() {
    let gw = make_gateway();
    let ns = NamespaceId::new();
    let key = seed_key(&gw).await;

    let first = handshake(&gw, ns, &key).await;
    let second = handshake(&gw, ns, &key).await;

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/{}/mcp", ns))
        .header("x-api-key", &key)
        .header("mcp-session-id", &first)
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let ping = |sid: String| {
        rpc_post(
            ns,
            &key,
            Some(&sid),
            json!({"jsonrpc": "2.0", "id": "9", "method": "ping"}),
        )
    };
    let gone = gw.router.clone().oneshot(ping(first)).await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    let alive = gw.router.clone().oneshot(ping(second)).await.unwrap();
    assert_eq!(alive.status(), StatusCode::OK);
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn health_reports_pools_and_cache() {
    let gw = make_gateway();
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], json!("healthy"));
    assert!(body["cache"]["hit_rate"].is_number());
    assert!(body["pools"]["sessions"].is_number());
}
