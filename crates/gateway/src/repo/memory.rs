//! In-memory repository
//!
//! The test seam: the same trait the Postgres repository implements, backed
//! by plain maps. Also handy for single-binary demos without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use metamcp_shared::{
    ApiKeyId, ApiKeyValidation, ErrorStatus, MappingStatus, McpServer, NamespaceId,
    NamespaceServerMapping, NamespaceToolMapping, ServerId,
};

use crate::auth::api_key::hash_secret;

use super::{RepoResult, Repository};

#[derive(Debug, Clone)]
struct StoredKey {
    id: ApiKeyId,
    user_id: Option<Uuid>,
    is_active: bool,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<ServerId, McpServer>,
    /// key hash -> key record
    keys: HashMap<String, StoredKey>,
    server_mappings: HashMap<NamespaceId, Vec<(ServerId, MappingStatus)>>,
    tool_mappings: HashMap<NamespaceId, Vec<NamespaceToolMapping>>,
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_server(&self, server: McpServer) {
        self.inner.write().await.servers.insert(server.id, server);
    }

    /// Register an API key secret; returns its id
    pub async fn insert_api_key(&self, secret: &str, user_id: Option<Uuid>) -> ApiKeyId {
        let id = ApiKeyId::new();
        self.inner.write().await.keys.insert(
            hash_secret(secret),
            StoredKey {
                id,
                user_id,
                is_active: true,
            },
        );
        id
    }

    pub async fn deactivate_api_key(&self, secret: &str) {
        if let Some(key) = self
            .inner
            .write()
            .await
            .keys
            .get_mut(&hash_secret(secret))
        {
            key.is_active = false;
        }
    }

    pub async fn map_server(
        &self,
        namespace_id: NamespaceId,
        server_id: ServerId,
        status: MappingStatus,
    ) {
        self.inner
            .write()
            .await
            .server_mappings
            .entry(namespace_id)
            .or_default()
            .push((server_id, status));
    }

    pub async fn map_tool(&self, namespace_id: NamespaceId, mapping: NamespaceToolMapping) {
        self.inner
            .write()
            .await
            .tool_mappings
            .entry(namespace_id)
            .or_default()
            .push(mapping);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn validate_api_key(&self, secret: &str) -> RepoResult<ApiKeyValidation> {
        let inner = self.inner.read().await;
        match inner.keys.get(&hash_secret(secret)) {
            Some(key) if key.is_active => Ok(ApiKeyValidation {
                valid: true,
                key_id: Some(key.id),
                user_id: key.user_id,
            }),
            _ => Ok(ApiKeyValidation::invalid()),
        }
    }

    async fn find_server(&self, id: ServerId) -> RepoResult<Option<McpServer>> {
        Ok(self.inner.read().await.servers.get(&id).cloned())
    }

    async fn all_servers(&self) -> RepoResult<Vec<McpServer>> {
        Ok(self.inner.read().await.servers.values().cloned().collect())
    }

    async fn set_server_error_status(&self, id: ServerId, status: ErrorStatus) -> RepoResult<()> {
        if let Some(server) = self.inner.write().await.servers.get_mut(&id) {
            server.error_status = status;
        }
        Ok(())
    }

    async fn namespace_server_mappings(
        &self,
        namespace_id: NamespaceId,
        include_inactive: bool,
    ) -> RepoResult<Vec<NamespaceServerMapping>> {
        let inner = self.inner.read().await;
        let Some(entries) = inner.server_mappings.get(&namespace_id) else {
            return Ok(Vec::new());
        };

        let mut mappings = Vec::new();
        for (server_id, status) in entries {
            if !include_inactive && !status.is_active() {
                continue;
            }
            if let Some(server) = inner.servers.get(server_id) {
                mappings.push(NamespaceServerMapping {
                    namespace_id,
                    server: server.clone(),
                    status: *status,
                });
            }
        }
        Ok(mappings)
    }

    async fn namespace_tool_mappings(
        &self,
        namespace_id: NamespaceId,
    ) -> RepoResult<Vec<NamespaceToolMapping>> {
        Ok(self
            .inner
            .read()
            .await
            .tool_mappings
            .get(&namespace_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metamcp_shared::ServerParams;

    fn make_server(name: &str) -> McpServer {
        McpServer {
            id: ServerId::new(),
            name: name.to_string(),
            params: ServerParams::stdio("echo", vec![]),
            error_status: ErrorStatus::None,
        }
    }

    #[tokio::test]
    async fn api_key_validation_lifecycle() {
        let repo = MemoryRepository::new();
        let key_id = repo.insert_api_key("sk_mt_test", None).await;

        let v = repo.validate_api_key("sk_mt_test").await.unwrap();
        assert!(v.valid);
        assert_eq!(v.key_id, Some(key_id));

        let v = repo.validate_api_key("sk_mt_other").await.unwrap();
        assert!(!v.valid);

        repo.deactivate_api_key("sk_mt_test").await;
        let v = repo.validate_api_key("sk_mt_test").await.unwrap();
        assert!(!v.valid);
    }

    #[tokio::test]
    async fn mappings_respect_include_inactive() {
        let repo = MemoryRepository::new();
        let ns = NamespaceId::new();
        let active = make_server("active");
        let inactive = make_server("inactive");
        let active_id = active.id;

        repo.insert_server(active).await;
        repo.insert_server(inactive.clone()).await;
        repo.map_server(ns, active_id, MappingStatus::Active).await;
        repo.map_server(ns, inactive.id, MappingStatus::Inactive)
            .await;

        let only_active = repo.namespace_server_mappings(ns, false).await.unwrap();
        assert_eq!(only_active.len(), 1);
        assert_eq!(only_active[0].server.id, active_id);

        let all = repo.namespace_server_mappings(ns, true).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn error_status_round_trip() {
        let repo = MemoryRepository::new();
        let server = make_server("s");
        let id = server.id;
        repo.insert_server(server).await;

        repo.set_server_error_status(id, ErrorStatus::Error)
            .await
            .unwrap();
        let found = repo.find_server(id).await.unwrap().unwrap();
        assert_eq!(found.error_status, ErrorStatus::Error);
    }
}
