//! Upstream error-state tracking
//!
//! Persists per-server error status through the repository and applies
//! short-lived launch cooldowns keyed by the spawn identity
//! (command + args + env), so a crash-looping stdio server is rejected fast
//! instead of being respawned on every request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use metamcp_shared::{ErrorStatus, ServerId, ServerParams};

use crate::repo::{RepoResult, Repository};

/// Default launch cooldown after a failed or crashed stdio spawn
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Deterministic identity of a stdio launch: command, args, env (sorted)
pub fn launch_identity(params: &ServerParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.command.as_deref().unwrap_or_default().as_bytes());
    for arg in &params.args {
        hasher.update(b"\0");
        hasher.update(arg.as_bytes());
    }
    let mut env: Vec<_> = params.env.iter().collect();
    env.sort();
    for (k, v) in env {
        hasher.update(b"\0");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub struct ErrorTracker {
    repo: Arc<dyn Repository>,
    cooldown: Duration,
    /// launch identity -> when the cooldown started
    cooldowns: RwLock<HashMap<String, Instant>>,
}

impl ErrorTracker {
    pub fn new(repo: Arc<dyn Repository>, cooldown: Duration) -> Self {
        Self {
            repo,
            cooldown,
            cooldowns: RwLock::new(HashMap::new()),
        }
    }

    /// Mark a server as crashed: persist ERROR and start a launch cooldown
    pub async fn record_crash(&self, server_id: ServerId, params: &ServerParams) {
        if let Err(e) = self
            .repo
            .set_server_error_status(server_id, ErrorStatus::Error)
            .await
        {
            tracing::error!(server_uuid = %server_id, error = %e, "failed to persist error status");
        }
        self.record_launch_failure(params).await;
    }

    /// Start a cooldown for this launch identity (spawn failed outright)
    pub async fn record_launch_failure(&self, params: &ServerParams) {
        if params.command.is_none() {
            return;
        }
        let identity = launch_identity(params);
        self.cooldowns
            .write()
            .await
            .insert(identity, Instant::now());
    }

    /// Whether new launch attempts for this identity should be rejected fast
    pub async fn cooldown_active(&self, params: &ServerParams) -> bool {
        if params.command.is_none() {
            return false;
        }
        let identity = launch_identity(params);
        let cooldowns = self.cooldowns.read().await;
        match cooldowns.get(&identity) {
            Some(started) => started.elapsed() < self.cooldown,
            None => false,
        }
    }

    pub async fn is_server_in_error_state(&self, server_id: ServerId) -> RepoResult<bool> {
        Ok(self
            .repo
            .find_server(server_id)
            .await?
            .map(|s| s.error_status == ErrorStatus::Error)
            .unwrap_or(false))
    }

    /// Clear the persisted error marker and any cooldown for the server
    pub async fn reset_server_error_state(&self, server_id: ServerId) -> RepoResult<()> {
        self.repo
            .set_server_error_status(server_id, ErrorStatus::None)
            .await?;

        if let Some(server) = self.repo.find_server(server_id).await? {
            if server.params.command.is_some() {
                let identity = launch_identity(&server.params);
                self.cooldowns.write().await.remove(&identity);
            }
        }
        Ok(())
    }

    /// Drop expired cooldown entries
    pub async fn sweep(&self) {
        let cooldown = self.cooldown;
        self.cooldowns
            .write()
            .await
            .retain(|_, started| started.elapsed() < cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;
    use metamcp_shared::McpServer;

    fn stdio_params(cmd: &str) -> ServerParams {
        ServerParams::stdio(cmd, vec!["--flag".into()])
    }

    #[test]
    fn identity_is_deterministic_and_env_order_free() {
        let mut a = stdio_params("npx");
        a.env.insert("B".into(), "2".into());
        a.env.insert("A".into(), "1".into());

        let mut b = stdio_params("npx");
        b.env.insert("A".into(), "1".into());
        b.env.insert("B".into(), "2".into());

        assert_eq!(launch_identity(&a), launch_identity(&b));
        assert_ne!(launch_identity(&a), launch_identity(&stdio_params("node")));
    }

    #[test]
    fn identity_distinguishes_args_from_command() {
        let joined = ServerParams::stdio("npx -y", vec![]);
        let split = ServerParams::stdio("npx", vec!["-y".into()]);
        assert_ne!(launch_identity(&joined), launch_identity(&split));
    }

    #[tokio::test]
    async fn cooldown_applies_and_expires() {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = ErrorTracker::new(repo, Duration::from_millis(50));
        let params = stdio_params("crashy");

        assert!(!tracker.cooldown_active(&params).await);
        tracker.record_launch_failure(&params).await;
        assert!(tracker.cooldown_active(&params).await);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!tracker.cooldown_active(&params).await);

        tracker.sweep().await;
        assert!(tracker.cooldowns.read().await.is_empty());
    }

    #[tokio::test]
    async fn crash_persists_error_state_and_reset_clears_it() {
        let repo = Arc::new(MemoryRepository::new());
        let server = McpServer {
            id: ServerId::new(),
            name: "crashy".into(),
            params: stdio_params("crashy"),
            error_status: ErrorStatus::None,
        };
        let id = server.id;
        let params = server.params.clone();
        repo.insert_server(server).await;

        let tracker = ErrorTracker::new(repo, DEFAULT_COOLDOWN);
        tracker.record_crash(id, &params).await;

        assert!(tracker.is_server_in_error_state(id).await.unwrap());
        assert!(tracker.cooldown_active(&params).await);

        tracker.reset_server_error_state(id).await.unwrap();
        assert!(!tracker.is_server_in_error_state(id).await.unwrap());
        assert!(!tracker.cooldown_active(&params).await);
    }

    #[tokio::test]
    async fn networked_servers_have_no_cooldown() {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = ErrorTracker::new(repo, DEFAULT_COOLDOWN);
        let params = ServerParams::streamable_http("https://mcp.example.com");

        tracker.record_launch_failure(&params).await;
        assert!(!tracker.cooldown_active(&params).await);
    }
}
