//! MetaMCP server factory
//!
//! Assembles a fresh MCP server instance per (namespace, API key) session:
//! the middleware-composed handler chain plus the capability surface the
//! gateway advertises. Cleanup revokes the handlers but leaves the API-key
//! bucket alone; other sessions may share it.

use std::sync::Arc;

use uuid::Uuid;

use metamcp_shared::{ApiKeyId, NamespaceId};

use crate::cache::ToolResponseCache;
use crate::mcp::pool::ConnectionPool;
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::repo::Repository;

use super::handlers::Aggregator;
use super::middleware::{cache_tool_calls, compose, filter_tools, Handler, RequestContext};

pub struct ServerFactory {
    repo: Arc<dyn Repository>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ToolResponseCache>,
}

impl ServerFactory {
    pub fn new(
        repo: Arc<dyn Repository>,
        pool: Arc<ConnectionPool>,
        cache: Arc<ToolResponseCache>,
    ) -> Self {
        Self { repo, pool, cache }
    }

    /// Build the per-session server: filter runs first, then the cache, then
    /// the terminal aggregation handlers.
    pub fn create(
        &self,
        namespace_id: NamespaceId,
        api_key: String,
        key_id: ApiKeyId,
        user_id: Option<Uuid>,
        include_inactive: bool,
    ) -> McpServerInstance {
        let context = Arc::new(RequestContext {
            namespace_id,
            api_key,
            key_id,
            user_id,
            include_inactive,
        });

        let aggregator = Arc::new(Aggregator::new(Arc::clone(&self.repo), Arc::clone(&self.pool)));
        let handler = compose(
            vec![
                filter_tools(Arc::clone(&self.repo)),
                cache_tool_calls(Arc::clone(&self.repo), Arc::clone(&self.cache)),
            ],
            aggregator.handler(),
        );

        McpServerInstance {
            context,
            handler: std::sync::Mutex::new(Some(handler)),
        }
    }
}

/// One session's MCP server
pub struct McpServerInstance {
    context: Arc<RequestContext>,
    handler: std::sync::Mutex<Option<Handler>>,
}

impl McpServerInstance {
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let handler = self.handler.lock().map(|g| (*g).clone()).unwrap_or(None);
        match handler {
            Some(handler) => handler(request, Arc::clone(&self.context)).await,
            None => JsonRpcResponse::error(
                request.id,
                JsonRpcError::internal_error("session is closed"),
            ),
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Revoke the handlers and drop per-session scratch state.
    /// Does not touch the API-key bucket.
    pub fn cleanup(&self) {
        if let Ok(mut guard) = self.handler.lock() {
            guard.take();
        }
    }
}
