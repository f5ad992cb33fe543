//! Composable handler middleware
//!
//! A handler maps `(request, context)` to a response; a middleware wraps a
//! handler and returns a new one. `compose(m1, m2)(h)` applies `m1(m2(h))`,
//! so the first middleware's pre-phase runs first and its post-phase last.
//! Session context is threaded as an explicit argument, never ambient state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use metamcp_shared::{ApiKeyId, MappingStatus, NamespaceId};

use crate::cache::{cache_key, ttl_for_tool, ToolResponseCache};
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolsListResult};
use crate::repo::Repository;

use super::handlers::{resolve_tool_target, sanitize_server_name, ResolveError};

/// Per-session request context, immutable for the session's lifetime
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub namespace_id: NamespaceId,
    pub api_key: String,
    pub key_id: ApiKeyId,
    pub user_id: Option<Uuid>,
    pub include_inactive: bool,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = JsonRpcResponse> + Send>>;

/// A request handler: `(request, context) -> response`
pub type Handler = Arc<dyn Fn(JsonRpcRequest, Arc<RequestContext>) -> HandlerFuture + Send + Sync>;

/// A middleware: `handler -> handler`
pub type Middleware = Box<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Compose middlewares around a terminal handler.
/// `compose([m1, m2], h) == m1(m2(h))`.
pub fn compose(middlewares: Vec<Middleware>, handler: Handler) -> Handler {
    middlewares
        .into_iter()
        .rev()
        .fold(handler, |inner, middleware| middleware(inner))
}

/// Helper for middlewares that synthesize responses
fn error_response(request: &JsonRpcRequest, error: JsonRpcError) -> JsonRpcResponse {
    JsonRpcResponse::error(request.id.clone(), error)
}

/// Tool-enablement filter.
///
/// Drops disabled tools from `tools/list` responses and rejects `tools/call`
/// against disabled tools with a structured error in the MCP response.
pub fn filter_tools(repo: Arc<dyn Repository>) -> Middleware {
    Box::new(move |next: Handler| {
        let repo = Arc::clone(&repo);
        Arc::new(move |request: JsonRpcRequest, ctx: Arc<RequestContext>| {
            let repo = Arc::clone(&repo);
            let next = Arc::clone(&next);
            Box::pin(async move {
                match request.method.as_str() {
                    "tools/call" => {
                        let requested = request
                            .params
                            .as_ref()
                            .and_then(|p| p.get("name"))
                            .and_then(Value::as_str)
                            .map(str::to_string);

                        if let Some(name) = requested {
                            match disabled_tool_names(&repo, &ctx).await {
                                Ok(disabled) if disabled.contains(&name) => {
                                    return error_response(
                                        &request,
                                        JsonRpcError::invalid_params(format!(
                                            "Tool is disabled in this namespace: {}",
                                            name
                                        )),
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::error!(
                                        namespace = %ctx.namespace_id,
                                        error = %e,
                                        "tool filter lookup failed; letting call through"
                                    );
                                }
                            }
                        }
                        next(request, ctx).await
                    }
                    "tools/list" => {
                        let disabled = match disabled_tool_names(&repo, &ctx).await {
                            Ok(d) => d,
                            Err(e) => {
                                tracing::error!(
                                    namespace = %ctx.namespace_id,
                                    error = %e,
                                    "tool filter lookup failed; returning unfiltered list"
                                );
                                return next(request, ctx).await;
                            }
                        };

                        let mut response = next(request, ctx).await;
                        if disabled.is_empty() {
                            return response;
                        }

                        if let Some(result) = response.result.take() {
                            match serde_json::from_value::<ToolsListResult>(result.clone()) {
                                Ok(mut list) => {
                                    list.tools.retain(|t| !disabled.contains(&t.name));
                                    response.result =
                                        serde_json::to_value(&list).ok().or(Some(Value::Null));
                                }
                                Err(_) => {
                                    // Not a list result; pass it through untouched
                                    response.result = Some(result);
                                }
                            }
                        }
                        response
                    }
                    _ => next(request, ctx).await,
                }
            })
        })
    })
}

/// Disabled tools for the namespace, as prefixed names
async fn disabled_tool_names(
    repo: &Arc<dyn Repository>,
    ctx: &RequestContext,
) -> Result<std::collections::HashSet<String>, crate::repo::RepoError> {
    let tool_mappings = repo.namespace_tool_mappings(ctx.namespace_id).await?;
    if tool_mappings.iter().all(|m| m.status.is_active()) {
        return Ok(Default::default());
    }

    let server_mappings = repo
        .namespace_server_mappings(ctx.namespace_id, true)
        .await?;
    let names_by_id: std::collections::HashMap<_, _> = server_mappings
        .iter()
        .map(|m| (m.server.id, sanitize_server_name(&m.server.name)))
        .collect();

    Ok(tool_mappings
        .iter()
        .filter(|m| m.status == MappingStatus::Inactive)
        .filter_map(|m| {
            names_by_id
                .get(&m.server_id)
                .map(|prefix| format!("{}__{}", prefix, m.name))
        })
        .collect())
}

/// Response cache for `tools/call`.
///
/// Short-circuits on an L1/L2 hit; otherwise passes through and stores
/// successful, cacheable results. Zero-TTL tools bypass the cache entirely.
pub fn cache_tool_calls(repo: Arc<dyn Repository>, cache: Arc<ToolResponseCache>) -> Middleware {
    Box::new(move |next: Handler| {
        let repo = Arc::clone(&repo);
        let cache = Arc::clone(&cache);
        Arc::new(move |request: JsonRpcRequest, ctx: Arc<RequestContext>| {
            let repo = Arc::clone(&repo);
            let cache = Arc::clone(&cache);
            let next = Arc::clone(&next);
            Box::pin(async move {
                if request.method != "tools/call" {
                    return next(request, ctx).await;
                }

                let Some(params) = request
                    .params
                    .clone()
                    .and_then(|p| serde_json::from_value::<ToolCallParams>(p).ok())
                else {
                    return next(request, ctx).await;
                };

                let target = resolve_tool_target(
                    &repo,
                    ctx.namespace_id,
                    ctx.include_inactive,
                    &params.name,
                )
                .await;
                let (server, original_name) = match target {
                    Ok(found) => found,
                    // Let the terminal handler produce the canonical error
                    Err(ResolveError::InvalidToolName | ResolveError::UnknownTool) => {
                        return next(request, ctx).await
                    }
                    Err(ResolveError::Repo(e)) => {
                        tracing::error!(error = %e, "cache resolution failed; bypassing cache");
                        return next(request, ctx).await;
                    }
                };

                let ttl = ttl_for_tool(&original_name, cache.default_ttl());
                if ttl.is_zero() {
                    return next(request, ctx).await;
                }

                let key = cache_key(
                    server.id,
                    &original_name,
                    Some(ctx.namespace_id),
                    &params.arguments,
                );

                if let Some(payload) = cache.get(&key).await {
                    tracing::debug!(
                        namespace = %ctx.namespace_id,
                        tool = %original_name,
                        "tool-cache hit"
                    );
                    return JsonRpcResponse::success(request.id.clone(), payload);
                }

                let response = next(request, ctx).await;

                if response.error.is_none() {
                    if let Some(ref result) = response.result {
                        let is_error_result = result
                            .get("isError")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if !is_error_result {
                            cache.set(&key, result.clone(), Some(ttl)).await;
                        }
                    }
                }
                response
            })
        })
    })
}
