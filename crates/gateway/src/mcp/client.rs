//! MCP Client for Upstream Connections
//!
//! One client per live upstream connection. Stdio upstreams run behind the
//! log-filtering adapter; networked upstreams (SSE and streamable-HTTP) go
//! through reqwest. Request deadlines come from the configured timeout
//! triple, consulted on every request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};

use metamcp_shared::{ServerKind, ServerParams};

use super::stdio::{FilteredStdioProcess, StdioEvent};
use super::types::*;

/// Error type for MCP client operations
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("MCP server returned error: {0}")]
    McpError(String),

    #[error("Transport not initialized")]
    NotInitialized,

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Process spawn failed: {0}")]
    ProcessError(String),

    #[error("Upstream connection closed")]
    Closed,
}

impl McpClientError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            McpClientError::HttpError(_) | McpClientError::Timeout | McpClientError::IoError(_)
        )
    }
}

/// Result type for MCP client operations
pub type McpResult<T> = Result<T, McpClientError>;

/// Request-level timeout options, consulted on every request
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeouts {
    /// Per-wait timeout; resettable by progress notifications
    pub timeout: Duration,
    /// Hard ceiling for the whole request
    pub max_total_timeout: Duration,
    /// Whether an upstream progress notification resets the per-wait timer
    pub reset_timeout_on_progress: bool,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_total_timeout: Duration::from_secs(120),
            reset_timeout_on_progress: true,
        }
    }
}

/// Callback fired when the upstream process exits or the transport drops
pub type CrashCallback = Arc<dyn Fn(Option<i32>, Option<i32>) + Send + Sync>;

/// Parse a response body handling both JSON and SSE framing.
/// Some streamable-HTTP servers answer `event: message\ndata: {...}`.
fn parse_response_body(body: &str) -> McpResult<JsonRpcResponse> {
    let trimmed = body.trim();

    if trimmed.starts_with("event:") || trimmed.starts_with("data:") {
        let mut last: Option<JsonRpcResponse> = None;
        for line in trimmed.lines() {
            if let Some(json_str) = line.trim().strip_prefix("data:") {
                let json_str = json_str.trim();
                if !json_str.is_empty() {
                    if let Ok(parsed) = serde_json::from_str(json_str) {
                        last = Some(parsed);
                    }
                }
            }
        }
        return last.ok_or(McpClientError::InvalidResponse);
    }

    serde_json::from_str(trimmed).map_err(McpClientError::from)
}

struct StdioTransport {
    process: FilteredStdioProcess,
    pending: Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    /// Pinged whenever the upstream emits notifications/progress
    progress: Arc<Notify>,
}

struct HttpTransport {
    http: Client,
    url: String,
    bearer_token: Option<String>,
    /// mcp-session-id negotiated with the upstream, if it uses sessions
    session_id: Mutex<Option<String>>,
}

enum Transport {
    Stdio(Arc<StdioTransport>),
    Http(HttpTransport),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stdio(_) => f.debug_tuple("Stdio").finish(),
            Transport::Http(t) => f.debug_tuple("Http").field(&t.url).finish(),
        }
    }
}

/// A connected upstream MCP client
#[derive(Debug)]
pub struct UpstreamClient {
    server_name: String,
    transport: Transport,
    timeouts: RequestTimeouts,
    request_id: AtomicI64,
    closing: Arc<AtomicBool>,
    capabilities: RwLock<Option<Capabilities>>,
}

impl UpstreamClient {
    /// Connect to an upstream and complete the MCP initialize handshake.
    ///
    /// `on_crash` fires when a stdio child exits or a networked transport
    /// drops, unless the close was requested via [`UpstreamClient::close`].
    pub async fn connect(
        server_name: &str,
        params: &ServerParams,
        timeouts: RequestTimeouts,
        on_crash: CrashCallback,
    ) -> McpResult<Arc<Self>> {
        let closing = Arc::new(AtomicBool::new(false));

        let transport = match params.kind {
            ServerKind::Stdio => {
                let command = params
                    .command
                    .as_deref()
                    .ok_or_else(|| McpClientError::ProcessError("missing command".into()))?;
                let (process, events) = FilteredStdioProcess::spawn(
                    server_name,
                    command,
                    &params.args,
                    &params.env,
                    params.cwd.as_deref(),
                )
                .await?;

                let stdio = Arc::new(StdioTransport {
                    process,
                    pending: Mutex::new(HashMap::new()),
                    progress: Arc::new(Notify::new()),
                });
                Self::spawn_dispatcher(Arc::clone(&stdio), events, on_crash, Arc::clone(&closing));
                Transport::Stdio(stdio)
            }
            ServerKind::Sse | ServerKind::StreamableHttp => {
                let url = params
                    .url
                    .as_deref()
                    .ok_or_else(|| McpClientError::ProcessError("missing url".into()))?;
                let http = Client::builder()
                    .timeout(timeouts.max_total_timeout)
                    .pool_max_idle_per_host(10)
                    .build()?;
                Transport::Http(HttpTransport {
                    http,
                    url: url.to_string(),
                    bearer_token: params.bearer_token.clone(),
                    session_id: Mutex::new(None),
                })
            }
        };

        let client = Arc::new(Self {
            server_name: server_name.to_string(),
            transport,
            timeouts,
            request_id: AtomicI64::new(1),
            closing,
            capabilities: RwLock::new(None),
        });

        if let Err(e) = client.initialize().await {
            client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Routes incoming stdio frames: responses to their pending waiters,
    /// progress notifications to the deadline reset, close to the crash hook.
    fn spawn_dispatcher(
        stdio: Arc<StdioTransport>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<StdioEvent>,
        on_crash: CrashCallback,
        closing: Arc<AtomicBool>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StdioEvent::Frame(frame) => {
                        let is_progress = frame.get("method").and_then(Value::as_str)
                            == Some("notifications/progress");
                        if is_progress {
                            stdio.progress.notify_waiters();
                            continue;
                        }
                        if frame.get("id").is_some()
                            && (frame.get("result").is_some() || frame.get("error").is_some())
                        {
                            match serde_json::from_value::<JsonRpcResponse>(frame) {
                                Ok(response) => {
                                    let key = response
                                        .id
                                        .as_ref()
                                        .map(|id| id.to_string())
                                        .unwrap_or_default();
                                    if let Some(tx) = stdio.pending.lock().await.remove(&key) {
                                        let _ = tx.send(response);
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "unparseable response frame");
                                }
                            }
                        }
                        // Server-initiated requests and other notifications
                        // are accepted and dropped; this gateway only proxies
                        // the tools surface.
                    }
                    StdioEvent::Closed { exit_code, signal } => {
                        // Fail anything still waiting
                        let mut pending = stdio.pending.lock().await;
                        pending.clear();
                        drop(pending);

                        if !closing.load(Ordering::Relaxed) {
                            on_crash(exit_code, signal);
                        }
                        break;
                    }
                }
            }
        });
    }

    fn next_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Complete the MCP initialize handshake and record capabilities
    async fn initialize(&self) -> McpResult<()> {
        let params = InitializeParams {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities::default(),
            client_info: ClientInfo {
                name: "metamcp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let payload = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(payload)?;
        *self.capabilities.write().await = Some(result.capabilities);

        self.notify("notifications/initialized", None).await?;
        Ok(())
    }

    /// Capabilities advertised by the upstream during initialize
    pub async fn server_capabilities(&self) -> Option<Capabilities> {
        self.capabilities.read().await.clone()
    }

    /// Send a request and return the `result` payload.
    ///
    /// Fails with [`McpClientError::Timeout`] when `max_total_timeout` is
    /// exceeded, or when the per-wait timeout lapses without progress.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(McpClientError::Closed);
        }

        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let response = match &self.transport {
            Transport::Stdio(stdio) => self.request_stdio(stdio, &request).await?,
            Transport::Http(http) => self.request_http(http, &request).await?,
        };

        if let Some(error) = response.error {
            return Err(McpClientError::McpError(error.message));
        }
        response.result.ok_or(McpClientError::InvalidResponse)
    }

    /// Fire-and-forget notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        match &self.transport {
            Transport::Stdio(stdio) => {
                stdio
                    .process
                    .send(&serde_json::to_value(&notification)?)
                    .await
            }
            Transport::Http(http) => {
                // Upstreams are not required to answer notifications
                let _ = self.post_http(http, &notification).await;
                Ok(())
            }
        }
    }

    async fn request_stdio(
        &self,
        stdio: &StdioTransport,
        request: &JsonRpcRequest,
    ) -> McpResult<JsonRpcResponse> {
        let key = request
            .id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();

        let (tx, mut rx) = oneshot::channel();
        stdio.pending.lock().await.insert(key.clone(), tx);

        if let Err(e) = stdio.process.send(&serde_json::to_value(request)?).await {
            stdio.pending.lock().await.remove(&key);
            return Err(e);
        }

        let total = tokio::time::sleep(self.timeouts.max_total_timeout);
        tokio::pin!(total);
        let progress = Arc::clone(&stdio.progress);

        loop {
            let idle = tokio::time::sleep(self.timeouts.timeout);
            tokio::pin!(idle);

            tokio::select! {
                res = &mut rx => {
                    return res.map_err(|_| McpClientError::Closed);
                }
                _ = progress.notified(), if self.timeouts.reset_timeout_on_progress => {
                    // Upstream is alive and working; restart the per-wait timer
                    continue;
                }
                _ = &mut idle => {
                    stdio.pending.lock().await.remove(&key);
                    return Err(McpClientError::Timeout);
                }
                _ = &mut total => {
                    stdio.pending.lock().await.remove(&key);
                    return Err(McpClientError::Timeout);
                }
            }
        }
    }

    async fn post_http(
        &self,
        http: &HttpTransport,
        request: &JsonRpcRequest,
    ) -> McpResult<reqwest::Response> {
        let mut builder = http
            .http
            .post(&http.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .timeout(self.timeouts.timeout);

        if let Some(ref token) = http.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref session_id) = *http.session_id.lock().await {
            builder = builder.header("Mcp-Session-Id", session_id.as_str());
        }

        let response = builder.json(request).send().await?;

        // Capture the upstream-assigned session on first exchange
        if let Some(sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = http.session_id.lock().await;
            if guard.is_none() {
                *guard = Some(sid.to_string());
            }
        }

        Ok(response)
    }

    async fn request_http(
        &self,
        http: &HttpTransport,
        request: &JsonRpcRequest,
    ) -> McpResult<JsonRpcResponse> {
        let fut = async {
            let response = self.post_http(http, request).await?;
            let body = response.text().await?;
            parse_response_body(&body)
        };

        match tokio::time::timeout(self.timeouts.max_total_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(McpClientError::Timeout),
        }
    }

    /// List tools offered by the upstream. Issued even when the upstream
    /// under-advertises `capabilities.tools`.
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let payload = self
            .request("tools/list", Some(serde_json::json!({})))
            .await?;
        let result: ToolsListResult = serde_json::from_value(payload)?;
        Ok(result.tools)
    }

    /// Call a tool on the upstream with the caller's original name and args
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        meta: Option<RequestMeta>,
    ) -> McpResult<ToolCallResult> {
        let params = ToolCallParams {
            name: tool_name.to_string(),
            arguments,
            meta,
        };
        let payload = self
            .request("tools/call", Some(serde_json::to_value(params)?))
            .await?;
        let result: ToolCallResult = serde_json::from_value(payload)?;
        Ok(result)
    }

    /// Close the connection. Stdio children get stdin-close, SIGTERM, then
    /// SIGKILL after the grace period. Suppresses the crash callback.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Transport::Stdio(stdio) = &self.transport {
            stdio.process.shutdown().await;
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Retry transient failures with exponential backoff + jitter.
/// Permanent errors (MCP errors, invalid payloads) are not retried.
pub async fn with_retry<T, F, Fut>(max_retries: usize, op: F) -> McpResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = McpResult<T>>,
{
    use tokio_retry::strategy::{jitter, ExponentialBackoff};
    use tokio_retry::Retry;

    let strategy = ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(5))
        .take(max_retries)
        .map(jitter);

    Retry::spawn(strategy, || async {
        match op().await {
            Ok(v) => Ok(Ok(v)),
            Err(e) if e.is_transient() => Err(Err(e)),
            Err(e) => Ok(Err(e)),
        }
    })
    .await
    .unwrap_or_else(|e| e)
}
