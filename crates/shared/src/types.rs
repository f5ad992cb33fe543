//! Common types used across the MetaMCP gateway

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// MCP server ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ServerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Namespace ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub Uuid);

impl NamespaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NamespaceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// API Key ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKeyId(pub Uuid);

impl ApiKeyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApiKeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ApiKeyId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ApiKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Transport kind of an upstream MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Persistent health marker for an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    None,
    Error,
}

impl Default for ErrorStatus {
    fn default() -> Self {
        Self::None
    }
}

/// Activation status of a namespace↔server or namespace↔tool mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Active,
    Inactive,
}

impl MappingStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

// =============================================================================
// Upstream server definition
// =============================================================================

/// Launch/connect parameters for an upstream MCP server.
///
/// Exactly one of `command` (stdio) or `url` (networked) is populated,
/// according to `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerParams {
    pub kind: ServerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl ServerParams {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: ServerKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            cwd: None,
            url: None,
            bearer_token: None,
        }
    }

    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self {
            kind: ServerKind::StreamableHttp,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.into()),
            bearer_token: None,
        }
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            kind: ServerKind::Sse,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.into()),
            bearer_token: None,
        }
    }

    /// Whether the populated fields are consistent with `kind`.
    pub fn is_valid(&self) -> bool {
        match self.kind {
            ServerKind::Stdio => self.command.is_some() && self.url.is_none(),
            ServerKind::Sse | ServerKind::StreamableHttp => {
                self.url.is_some() && self.command.is_none()
            }
        }
    }
}

/// An upstream MCP server definition as stored by the repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub id: ServerId,
    pub name: String,
    pub params: ServerParams,
    #[serde(default)]
    pub error_status: ErrorStatus,
}

// =============================================================================
// Namespace mappings
// =============================================================================

/// Membership of a server in a namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceServerMapping {
    pub namespace_id: NamespaceId,
    pub server: McpServer,
    pub status: MappingStatus,
}

/// Per-namespace enablement of a single tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceToolMapping {
    pub tool_id: Uuid,
    pub server_id: ServerId,
    pub name: String,
    pub status: MappingStatus,
}

// =============================================================================
// API keys
// =============================================================================

/// Outcome of validating an API-key secret against the repository
#[derive(Debug, Clone)]
pub struct ApiKeyValidation {
    pub valid: bool,
    pub key_id: Option<ApiKeyId>,
    pub user_id: Option<Uuid>,
}

impl ApiKeyValidation {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            key_id: None,
            user_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_params_valid() {
        let p = ServerParams::stdio("npx", vec!["-y".into(), "some-mcp".into()]);
        assert!(p.is_valid());
        assert_eq!(p.kind, ServerKind::Stdio);
    }

    #[test]
    fn http_params_valid() {
        let p = ServerParams::streamable_http("https://mcp.example.com/mcp");
        assert!(p.is_valid());
    }

    #[test]
    fn mixed_params_invalid() {
        let mut p = ServerParams::stdio("npx", vec![]);
        p.url = Some("https://example.com".into());
        assert!(!p.is_valid());
    }

    #[test]
    fn server_params_round_trip() {
        let p = ServerParams::sse("https://mcp.example.com/sse");
        let json = serde_json::to_string(&p).unwrap();
        let back: ServerParams = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn mapping_status_active() {
        assert!(MappingStatus::Active.is_active());
        assert!(!MappingStatus::Inactive.is_active());
    }
}
