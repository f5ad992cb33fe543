//! MCP upstream plumbing
//!
//! The gateway's client side of the Model Context Protocol: transports
//! (stdio with log filtering, SSE, streamable-HTTP), the per-connection
//! client, crash/error tracking, and the per-API-key connection pool.

pub mod client;
pub mod error_tracker;
pub mod pool;
pub mod stdio;
pub mod types;

pub use client::{McpClientError, RequestTimeouts, UpstreamClient};
pub use error_tracker::ErrorTracker;
pub use pool::{ConnectionPool, PoolConfig, PoolError};
