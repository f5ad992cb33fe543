//! Gateway configuration

use std::env;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::mcp::client::RequestTimeouts;
use crate::mcp::error_tracker::DEFAULT_COOLDOWN;
use crate::mcp::pool::PoolConfig;
use crate::session::SessionConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database (absent → in-memory repository, single-binary mode)
    pub database_url: Option<String>,

    // Upstream request timeouts
    pub mcp_request_timeout_ms: u64,
    pub mcp_max_total_timeout_ms: u64,
    pub mcp_reset_timeout_on_progress: bool,

    // Connection pool
    pub pool_max_idle_secs: u64,
    pub pool_cleanup_interval_secs: u64,
    pub max_connections_per_api_key: usize,
    pub max_global_connections: usize,

    // Stdio launch cooldown
    pub stdio_cooldown_secs: u64,

    // Tool response cache
    pub tool_cache_max_entries: usize,
    pub tool_cache_default_ttl_secs: u64,
    pub tool_cache_cleanup_interval_secs: u64,
    pub cache_l2_url: Option<String>,
    pub cache_l2_token: Option<String>,

    // Sessions
    pub session_max_idle_secs: u64,
    pub session_cleanup_interval_secs: u64,

    // HTTP limits
    pub max_request_body_bytes: usize,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL").ok(),

            mcp_request_timeout_ms: env_parse("MCP_REQUEST_TIMEOUT_MS", 30_000),
            mcp_max_total_timeout_ms: env_parse("MCP_MAX_TOTAL_TIMEOUT_MS", 120_000),
            mcp_reset_timeout_on_progress: env_parse("MCP_RESET_TIMEOUT_ON_PROGRESS", true),

            pool_max_idle_secs: env_parse("POOL_MAX_IDLE_SECS", 2 * 60 * 60),
            pool_cleanup_interval_secs: env_parse("POOL_CLEANUP_INTERVAL_SECS", 30 * 60),
            max_connections_per_api_key: env_parse("MAX_CONNECTIONS_PER_API_KEY", 50),
            max_global_connections: env_parse("MAX_GLOBAL_CONNECTIONS", 100),

            stdio_cooldown_secs: env_parse("STDIO_COOLDOWN_SECS", DEFAULT_COOLDOWN.as_secs()),

            tool_cache_max_entries: env_parse("TOOL_CACHE_MAX_ENTRIES", 1000),
            tool_cache_default_ttl_secs: env_parse("TOOL_CACHE_DEFAULT_TTL_SECS", 300),
            tool_cache_cleanup_interval_secs: env_parse("TOOL_CACHE_CLEANUP_INTERVAL_SECS", 60),
            cache_l2_url: env::var("CACHE_L2_URL").ok(),
            cache_l2_token: env::var("CACHE_L2_TOKEN").ok(),

            session_max_idle_secs: env_parse("SESSION_MAX_IDLE_SECS", 2 * 60 * 60),
            session_cleanup_interval_secs: env_parse("SESSION_CLEANUP_INTERVAL_SECS", 30 * 60),

            max_request_body_bytes: env_parse("MAX_REQUEST_BODY_BYTES", 1024 * 1024),
        }
    }

    pub fn request_timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            timeout: Duration::from_millis(self.mcp_request_timeout_ms),
            max_total_timeout: Duration::from_millis(self.mcp_max_total_timeout_ms),
            reset_timeout_on_progress: self.mcp_reset_timeout_on_progress,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_time: Duration::from_secs(self.pool_max_idle_secs),
            cleanup_interval: Duration::from_secs(self.pool_cleanup_interval_secs),
            max_connections_per_key: self.max_connections_per_api_key,
            max_global_connections: self.max_global_connections,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_memory_entries: self.tool_cache_max_entries,
            default_ttl: Duration::from_secs(self.tool_cache_default_ttl_secs),
            cleanup_interval: Duration::from_secs(self.tool_cache_cleanup_interval_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_idle_time: Duration::from_secs(self.session_max_idle_secs),
            cleanup_interval: Duration::from_secs(self.session_cleanup_interval_secs),
        }
    }

    pub fn stdio_cooldown(&self) -> Duration {
        Duration::from_secs(self.stdio_cooldown_secs)
    }
}
