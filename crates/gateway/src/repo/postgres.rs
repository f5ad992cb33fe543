//! Postgres-backed repository

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use metamcp_shared::{
    ApiKeyValidation, ErrorStatus, MappingStatus, McpServer, NamespaceId, NamespaceServerMapping,
    NamespaceToolMapping, ServerId, ServerParams,
};

use crate::auth::api_key::hash_secret;

use super::{RepoError, RepoResult, Repository};

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_server(
        id: Uuid,
        name: String,
        params: Value,
        error_status: ErrorStatus,
    ) -> Option<McpServer> {
        let params: ServerParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(server_uuid = %id, error = %e, "unparseable server params");
                return None;
            }
        };
        Some(McpServer {
            id: ServerId(id),
            name,
            params,
            error_status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ServerRow {
    id: Uuid,
    name: String,
    params: Value,
    error_status: ErrorStatus,
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    id: Uuid,
    name: String,
    params: Value,
    error_status: ErrorStatus,
    status: MappingStatus,
}

#[async_trait]
impl Repository for PgRepository {
    async fn validate_api_key(&self, secret: &str) -> RepoResult<ApiKeyValidation> {
        #[derive(sqlx::FromRow)]
        struct KeyRow {
            id: Uuid,
            user_id: Option<Uuid>,
            is_active: bool,
            expires_at: Option<time::OffsetDateTime>,
        }

        let key_hash = hash_secret(secret);
        let row: Option<KeyRow> = sqlx::query_as(
            "SELECT id, user_id, is_active, expires_at FROM api_keys WHERE key_hash = $1",
        )
        .bind(&key_hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) if row.is_active => {
                if let Some(expires_at) = row.expires_at {
                    if expires_at < time::OffsetDateTime::now_utc() {
                        return Ok(ApiKeyValidation::invalid());
                    }
                }
                Ok(ApiKeyValidation {
                    valid: true,
                    key_id: Some(row.id.into()),
                    user_id: row.user_id,
                })
            }
            _ => Ok(ApiKeyValidation::invalid()),
        }
    }

    async fn find_server(&self, id: ServerId) -> RepoResult<Option<McpServer>> {
        let row: Option<ServerRow> = sqlx::query_as(
            "SELECT id, name, params, error_status FROM mcp_servers WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| Self::row_to_server(r.id, r.name, r.params, r.error_status)))
    }

    async fn all_servers(&self) -> RepoResult<Vec<McpServer>> {
        let rows: Vec<ServerRow> =
            sqlx::query_as("SELECT id, name, params, error_status FROM mcp_servers ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| Self::row_to_server(r.id, r.name, r.params, r.error_status))
            .collect())
    }

    async fn set_server_error_status(&self, id: ServerId, status: ErrorStatus) -> RepoResult<()> {
        sqlx::query("UPDATE mcp_servers SET error_status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn namespace_server_mappings(
        &self,
        namespace_id: NamespaceId,
        include_inactive: bool,
    ) -> RepoResult<Vec<NamespaceServerMapping>> {
        let rows: Vec<MappingRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.name, s.params, s.error_status, m.status
            FROM namespace_server_mappings m
            JOIN mcp_servers s ON s.id = m.server_id
            WHERE m.namespace_id = $1
              AND ($2 OR m.status = 'active')
            ORDER BY m.created_at
            "#,
        )
        .bind(namespace_id.0)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let status = r.status;
                Self::row_to_server(r.id, r.name, r.params, r.error_status).map(|server| {
                    NamespaceServerMapping {
                        namespace_id,
                        server,
                        status,
                    }
                })
            })
            .collect())
    }

    async fn namespace_tool_mappings(
        &self,
        namespace_id: NamespaceId,
    ) -> RepoResult<Vec<NamespaceToolMapping>> {
        #[derive(sqlx::FromRow)]
        struct ToolRow {
            tool_id: Uuid,
            server_id: Uuid,
            name: String,
            status: MappingStatus,
        }

        let rows: Vec<ToolRow> = sqlx::query_as(
            r#"
            SELECT m.tool_id, t.server_id, t.name, m.status
            FROM namespace_tool_mappings m
            JOIN tools t ON t.id = m.tool_id
            WHERE m.namespace_id = $1
            "#,
        )
        .bind(namespace_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepoError::from)?;

        Ok(rows
            .into_iter()
            .map(|r| NamespaceToolMapping {
                tool_id: r.tool_id,
                server_id: ServerId(r.server_id),
                name: r.name,
                status: r.status,
            })
            .collect())
    }
}
