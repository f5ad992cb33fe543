//! MetaMCP Gateway Library
//!
//! Aggregates many upstream MCP servers into one MCP endpoint per
//! namespace: clients connect once, see a merged tool catalog, and the
//! gateway routes calls to the right upstream with per-API-key isolation,
//! pooled upstream connections, and response caching.

pub mod aggregate;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod mcp;
pub mod repo;
pub mod routes;
pub mod session;
pub mod state;
pub mod startup;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
