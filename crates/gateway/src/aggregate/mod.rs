//! Aggregation pipeline
//!
//! The handler chain a session's requests flow through: tool filtering,
//! response caching, then the fan-out/dispatch terminal handlers.

pub mod handlers;
pub mod middleware;
pub mod server;

pub use handlers::{prefixed_tool_name, sanitize_server_name, Aggregator};
pub use middleware::{compose, Handler, Middleware, RequestContext};
pub use server::{McpServerInstance, ServerFactory};
