//! MCP method handlers
//!
//! The terminal handlers behind the middleware chain: `tools/list` fans out
//! to every mapped upstream and merges the catalogs under prefixed names;
//! `tools/call` parses the prefix and routes to exactly one upstream.
//! Partial upstream failures are logged and excluded, never fatal.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use metamcp_shared::{ErrorStatus, McpServer, NamespaceId};

use crate::mcp::client::with_retry;
use crate::mcp::pool::{ConnectionPool, PoolError};
use crate::mcp::types::*;
use crate::repo::{RepoError, Repository};

use super::middleware::{Handler, RequestContext};

/// Per-upstream allowance inside a list fan-out
const LIST_FANOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries for transient upstream failures during aggregation
const LIST_RETRIES: usize = 2;

/// Replace anything outside `[A-Za-z0-9_]` so server names survive inside
/// tool identifiers. Idempotent.
pub fn sanitize_server_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Build the client-facing name for one upstream tool
pub fn prefixed_tool_name(server_name: &str, tool_name: &str) -> String {
    format!("{}__{}", sanitize_server_name(server_name), tool_name)
}

#[derive(Debug)]
pub enum ResolveError {
    /// No `__` separator in the requested name
    InvalidToolName,
    /// Prefix resolves to no mapped upstream
    UnknownTool,
    Repo(RepoError),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::InvalidToolName => write!(f, "invalid tool name"),
            ResolveError::UnknownTool => write!(f, "unknown tool prefix"),
            ResolveError::Repo(e) => write!(f, "{}", e),
        }
    }
}

/// Split `{prefix}__{original}` on the first separator and resolve the prefix
/// to its upstream. Ties break on mapping order.
pub async fn resolve_tool_target(
    repo: &Arc<dyn Repository>,
    namespace_id: NamespaceId,
    include_inactive: bool,
    prefixed_name: &str,
) -> Result<(McpServer, String), ResolveError> {
    let (prefix, original) = prefixed_name
        .split_once("__")
        .ok_or(ResolveError::InvalidToolName)?;
    if prefix.is_empty() {
        return Err(ResolveError::InvalidToolName);
    }

    let mappings = repo
        .namespace_server_mappings(namespace_id, include_inactive)
        .await
        .map_err(ResolveError::Repo)?;

    let server = mappings
        .into_iter()
        .map(|m| m.server)
        .find(|s| sanitize_server_name(&s.name) == prefix)
        .ok_or(ResolveError::UnknownTool)?;

    Ok((server, original.to_string()))
}

/// The terminal handler set, shared by every session of the gateway
pub struct Aggregator {
    repo: Arc<dyn Repository>,
    pool: Arc<ConnectionPool>,
}

impl Aggregator {
    pub fn new(repo: Arc<dyn Repository>, pool: Arc<ConnectionPool>) -> Self {
        Self { repo, pool }
    }

    /// The dispatch handler used as the innermost element of the chain
    pub fn handler(self: Arc<Self>) -> Handler {
        Arc::new(move |request, ctx| {
            let aggregator = Arc::clone(&self);
            Box::pin(async move { aggregator.handle(request, ctx).await })
        })
    }

    async fn handle(&self, request: JsonRpcRequest, ctx: Arc<RequestContext>) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => Self::handle_initialize(request.id),
            "ping" => JsonRpcResponse::success(request.id, serde_json::json!({})),
            "tools/list" => self.handle_tools_list(request.id, &ctx).await,
            "tools/call" => self.handle_tools_call(request.id, request.params, &ctx).await,
            method if method.starts_with("notifications/") => {
                JsonRpcResponse::success(None, Value::Null)
            }
            method => JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(method)),
        }
    }

    fn handle_initialize(id: Option<JsonRpcId>) -> JsonRpcResponse {
        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities {
                tools: Some(ToolsCapability::default()),
                ..Default::default()
            },
            server_info: ServerInfo {
                name: "metamcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "MetaMCP aggregates multiple MCP servers. Tools are prefixed with their \
                 source server name (e.g. File_Ops__read_file)."
                    .to_string(),
            ),
        };
        success_response(id, &result)
    }

    /// Fan out `tools/list` to every mapped upstream
    async fn handle_tools_list(
        &self,
        id: Option<JsonRpcId>,
        ctx: &RequestContext,
    ) -> JsonRpcResponse {
        let mappings = match self
            .repo
            .namespace_server_mappings(ctx.namespace_id, ctx.include_inactive)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::internal_error(format!("Failed to load namespace servers: {}", e)),
                );
            }
        };

        if mappings.is_empty() {
            return success_response(
                id,
                &ToolsListResult {
                    tools: vec![],
                    next_cursor: None,
                },
            );
        }

        let mut tasks = FuturesUnordered::new();
        for mapping in mappings {
            let server = mapping.server;
            let pool = Arc::clone(&self.pool);
            let repo = Arc::clone(&self.repo);
            let api_key = ctx.api_key.clone();
            let key_id = ctx.key_id;
            let namespace_id = ctx.namespace_id;

            tasks.push(async move {
                // Error-state upstreams stay visible in the catalog from the
                // repository's tool records; calls against them short-circuit.
                if server.error_status == ErrorStatus::Error {
                    let known = repo
                        .namespace_tool_mappings(namespace_id)
                        .await
                        .unwrap_or_default();
                    let tools: Vec<Tool> = known
                        .into_iter()
                        .filter(|t| t.server_id == server.id)
                        .map(|t| Tool {
                            name: t.name,
                            description: None,
                            input_schema: serde_json::json!({"type": "object"}),
                        })
                        .collect();
                    return Some((server.name, tools));
                }

                let client = match pool.get_connection(&api_key, key_id, &server).await {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!(
                            namespace = %namespace_id,
                            server_uuid = %server.id,
                            error = %e,
                            "skipping upstream in list fan-out"
                        );
                        return None;
                    }
                };

                // Under-advertising upstreams exist; issue the request even
                // when capabilities.tools is absent.
                if let Some(caps) = client.server_capabilities().await {
                    if caps.tools.is_none() {
                        tracing::debug!(server_uuid = %server.id, "upstream does not advertise tools");
                    }
                }

                let listed = tokio::time::timeout(
                    LIST_FANOUT_TIMEOUT,
                    with_retry(LIST_RETRIES, || client.list_tools()),
                )
                .await;

                match listed {
                    Ok(Ok(tools)) => Some((server.name, tools)),
                    Ok(Err(e)) => {
                        tracing::error!(
                            namespace = %namespace_id,
                            server_uuid = %server.id,
                            error = %e,
                            "upstream tools/list failed"
                        );
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            namespace = %namespace_id,
                            server_uuid = %server.id,
                            "upstream tools/list timed out"
                        );
                        None
                    }
                }
            });
        }

        let mut all_tools = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Some((server_name, tools)) = result {
                all_tools.extend(tools.into_iter().map(|mut tool| {
                    tool.name = prefixed_tool_name(&server_name, &tool.name);
                    tool
                }));
            }
        }

        success_response(
            id,
            &ToolsListResult {
                tools: all_tools,
                next_cursor: None,
            },
        )
    }

    /// Route `tools/call` to the upstream named by the prefix
    async fn handle_tools_call(
        &self,
        id: Option<JsonRpcId>,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> JsonRpcResponse {
        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(parsed)) => parsed,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid params: {}", e)),
                );
            }
            None => {
                return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Missing params"));
            }
        };

        let (server, original_name) = match resolve_tool_target(
            &self.repo,
            ctx.namespace_id,
            ctx.include_inactive,
            &params.name,
        )
        .await
        {
            Ok(found) => found,
            Err(ResolveError::InvalidToolName) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!(
                        "Invalid tool name, expected 'Server__tool': {}",
                        params.name
                    )),
                );
            }
            Err(ResolveError::UnknownTool) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!(
                        "No upstream matches tool prefix: {}",
                        params.name
                    )),
                );
            }
            Err(ResolveError::Repo(e)) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::internal_error(format!("Failed to load namespace servers: {}", e)),
                );
            }
        };

        // Error-state servers answer with an in-band tool error, never a
        // transport-level failure.
        if server.error_status == ErrorStatus::Error {
            return success_response(
                id,
                &ToolCallResult::error_text("server in error state; reset required"),
            );
        }

        let client = match self
            .pool
            .get_connection(&ctx.api_key, ctx.key_id, &server)
            .await
        {
            Ok(client) => client,
            Err(e) if matches!(e, PoolError::PerKeyLimit | PoolError::GlobalLimit) => {
                // Resource exhaustion is surfaced at the HTTP layer as 503
                return JsonRpcResponse::error(id, JsonRpcError::resource_limit(e.to_string()));
            }
            Err(e) => {
                tracing::warn!(
                    namespace = %ctx.namespace_id,
                    server_uuid = %server.id,
                    tool = %original_name,
                    error = %e,
                    "upstream unavailable for tools/call"
                );
                return success_response(
                    id,
                    &ToolCallResult::error_text(format!(
                        "Upstream '{}' unavailable: {}",
                        server.name, e
                    )),
                );
            }
        };

        match client
            .call_tool(&original_name, params.arguments, params.meta)
            .await
        {
            Ok(result) => success_response(id, &result),
            Err(e) => {
                tracing::error!(
                    namespace = %ctx.namespace_id,
                    server_uuid = %server.id,
                    tool = %original_name,
                    error = %e,
                    "tools/call failed"
                );
                success_response(
                    id,
                    &ToolCallResult::error_text(format!(
                        "Tool call failed on {}: {}",
                        server.name, e
                    )),
                )
            }
        }
    }
}

/// Serialize a success result, degrading to an internal error on failure
fn success_response<T: serde::Serialize>(id: Option<JsonRpcId>, value: &T) -> JsonRpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => JsonRpcResponse::success(id, v),
        Err(e) => {
            tracing::error!("Failed to serialize response: {}", e);
            JsonRpcResponse::error(
                id,
                JsonRpcError::internal_error(format!("Serialization error: {}", e)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_identifier_chars() {
        assert_eq!(sanitize_server_name("File Ops"), "File_Ops");
        assert_eq!(sanitize_server_name("a-b.c"), "a_b_c");
        assert_eq!(sanitize_server_name("plain_name7"), "plain_name7");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_server_name("Söme Séßver!");
        assert_eq!(sanitize_server_name(&once), once);
    }

    #[test]
    fn prefixing_round_trips_through_split() {
        let name = prefixed_tool_name("File Ops", "read_file");
        assert_eq!(name, "File_Ops__read_file");
        let (prefix, original) = name.split_once("__").unwrap();
        assert_eq!(prefix, "File_Ops");
        assert_eq!(original, "read_file");
    }

    #[test]
    fn split_takes_first_separator() {
        // Tool names may themselves contain the separator
        let name = "srv__tool__with__underscores";
        let (prefix, original) = name.split_once("__").unwrap();
        assert_eq!(prefix, "srv");
        assert_eq!(original, "tool__with__underscores");
    }
}
