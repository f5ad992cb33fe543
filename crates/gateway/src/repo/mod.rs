//! Repository interface
//!
//! The gateway consumes server definitions, namespace mappings, tool
//! enablement, and API keys through this trait. The production
//! implementation is Postgres-backed; tests run against the in-memory
//! implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use metamcp_shared::{
    ApiKeyValidation, ErrorStatus, McpServer, NamespaceId, NamespaceServerMapping,
    NamespaceToolMapping, ServerId,
};

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        RepoError::Database(err.to_string())
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Validate an API-key secret, yielding the key identity when active
    async fn validate_api_key(&self, secret: &str) -> RepoResult<ApiKeyValidation>;

    /// Look up one server definition
    async fn find_server(&self, id: ServerId) -> RepoResult<Option<McpServer>>;

    /// All server definitions known to the gateway
    async fn all_servers(&self) -> RepoResult<Vec<McpServer>>;

    /// Persist the health marker for a server
    async fn set_server_error_status(&self, id: ServerId, status: ErrorStatus) -> RepoResult<()>;

    /// Servers mapped into a namespace. Inactive mappings are included only
    /// when `include_inactive` is set.
    async fn namespace_server_mappings(
        &self,
        namespace_id: NamespaceId,
        include_inactive: bool,
    ) -> RepoResult<Vec<NamespaceServerMapping>>;

    /// Per-namespace tool enablement
    async fn namespace_tool_mappings(
        &self,
        namespace_id: NamespaceId,
    ) -> RepoResult<Vec<NamespaceToolMapping>>;
}
