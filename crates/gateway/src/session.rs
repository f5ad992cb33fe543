//! Client session table
//!
//! One entry per live MCP client conversation. A session is pinned to the
//! (namespace, API key) pair it was created with for its whole lifetime;
//! ownership is enforced on every request. The idle reaper tears down
//! sessions whose last access is older than the configured idle window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use metamcp_shared::{ApiKeyId, NamespaceId};

use crate::aggregate::McpServerInstance;
use crate::mcp::types::JsonRpcResponse;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_idle_time: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Ready,
    Closing,
    Closed,
}

/// Which transport modality the client connected over
pub enum SessionTransport {
    StreamableHttp,
    /// Legacy dual-endpoint SSE; responses flow out through this channel
    Sse {
        outbound: mpsc::Sender<JsonRpcResponse>,
    },
}

pub struct Session {
    pub id: Uuid,
    pub namespace_id: NamespaceId,
    pub api_key: String,
    pub key_id: ApiKeyId,
    pub transport: SessionTransport,
    pub instance: Arc<McpServerInstance>,
    state: Mutex<SessionState>,
    last_access: Mutex<Instant>,
    #[allow(dead_code)] // Surfaced in session introspection
    created_at: Instant,
}

impl Session {
    pub fn new(
        namespace_id: NamespaceId,
        api_key: String,
        key_id: ApiKeyId,
        transport: SessionTransport,
        instance: Arc<McpServerInstance>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace_id,
            api_key,
            key_id,
            transport,
            instance,
            state: Mutex::new(SessionState::Created),
            last_access: Mutex::new(Instant::now()),
            created_at: Instant::now(),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn mark_ready(&self) {
        let mut state = self.state.lock().await;
        if *state == SessionState::Created {
            *state = SessionState::Ready;
        }
    }

    /// Refresh the idle clock. A request landing at the exact idle cutoff
    /// refreshes and is served; eviction only happens in the reaper tick.
    pub async fn touch(&self) {
        *self.last_access.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_access.lock().await.elapsed()
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            *state = SessionState::Closing;
        }
        self.instance.cleanup();
        let mut state = self.state.lock().await;
        *state = SessionState::Closed;
    }

    /// Whether `(api_key, namespace)` matches this session's owner
    pub fn owned_by(&self, api_key: &str, namespace_id: NamespaceId) -> bool {
        self.api_key == api_key && self.namespace_id == namespace_id
    }
}

/// Session counters for /health and /metrics
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SessionStatus {
    pub active: usize,
}

pub struct SessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.id, session);
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Close and remove one session
    pub async fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(&id);
        if let Some(ref session) = session {
            session.close().await;
            tracing::info!(session_id = %id, namespace = %session.namespace_id, "session closed");
        }
        session
    }

    /// Close and remove every session owned by `api_key`; returns the count
    pub async fn remove_all_for_key(&self, api_key: &str) -> usize {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<Uuid> = sessions
                .values()
                .filter(|s| s.api_key == api_key)
                .map(|s| s.id)
                .collect();
            ids.into_iter().filter_map(|id| sessions.remove(&id)).collect()
        };

        for session in &removed {
            session.close().await;
            tracing::info!(session_id = %session.id, "session closed (bulk delete)");
        }
        removed.len()
    }

    /// Reap sessions idle past `max_idle_time`. Takes a consistent snapshot
    /// before closing anything.
    pub async fn reap_idle(&self) -> usize {
        let candidates: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut reaped = 0;
        for session in candidates {
            if session.idle_for().await > self.config.max_idle_time {
                if self.remove(session.id).await.is_some() {
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            tracing::info!(count = reaped, "idle sessions reaped");
        }
        reaped
    }

    /// Shutdown: close everything
    pub async fn close_all(&self) {
        let all: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in all {
            session.close().await;
        }
    }

    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            active: self.sessions.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, ToolResponseCache};
    use crate::mcp::client::RequestTimeouts;
    use crate::mcp::error_tracker::ErrorTracker;
    use crate::mcp::pool::{ConnectionPool, PoolConfig};
    use crate::repo::{MemoryRepository, Repository};
    use crate::aggregate::ServerFactory;

    fn make_session(api_key: &str, namespace_id: NamespaceId) -> Arc<Session> {
        let repo = Arc::new(MemoryRepository::new());
        let tracker = Arc::new(ErrorTracker::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Duration::from_secs(10),
        ));
        let pool = ConnectionPool::new(PoolConfig::default(), RequestTimeouts::default(), tracker);
        let cache = Arc::new(ToolResponseCache::new(CacheConfig::default(), None));
        let factory = ServerFactory::new(repo, pool, cache);
        let instance = Arc::new(factory.create(
            namespace_id,
            api_key.to_string(),
            ApiKeyId::new(),
            None,
            false,
        ));
        Arc::new(Session::new(
            namespace_id,
            api_key.to_string(),
            ApiKeyId::new(),
            SessionTransport::StreamableHttp,
            instance,
        ))
    }

    fn store_with_idle(max_idle_time: Duration) -> SessionStore {
        SessionStore::new(SessionConfig {
            max_idle_time,
            cleanup_interval: Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn state_progression() {
        let ns = NamespaceId::new();
        let session = make_session("sk_mt_a", ns);
        assert_eq!(session.state().await, SessionState::Created);

        session.mark_ready().await;
        assert_eq!(session.state().await, SessionState::Ready);

        // mark_ready is only the Created -> Ready edge
        session.mark_ready().await;
        assert_eq!(session.state().await, SessionState::Ready);

        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn ownership_is_strict() {
        let ns = NamespaceId::new();
        let session = make_session("sk_mt_a", ns);

        assert!(session.owned_by("sk_mt_a", ns));
        assert!(!session.owned_by("sk_mt_b", ns));
        assert!(!session.owned_by("sk_mt_a", NamespaceId::new()));
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let store = store_with_idle(Duration::from_secs(60));
        let session = make_session("sk_mt_a", NamespaceId::new());
        let id = session.id;

        store.insert(Arc::clone(&session)).await;
        assert!(store.get(id).await.is_some());
        assert_eq!(store.status().await.active, 1);

        let removed = store.remove(id).await.expect("session existed");
        assert_eq!(removed.state().await, SessionState::Closed);
        assert!(store.get(id).await.is_none());
    }

    #[tokio::test]
    async fn bulk_delete_only_hits_owner_key() {
        let store = store_with_idle(Duration::from_secs(60));
        let ns = NamespaceId::new();
        let a1 = make_session("sk_mt_a", ns);
        let a2 = make_session("sk_mt_a", ns);
        let b = make_session("sk_mt_b", ns);

        store.insert(Arc::clone(&a1)).await;
        store.insert(Arc::clone(&a2)).await;
        store.insert(Arc::clone(&b)).await;

        let removed = store.remove_all_for_key("sk_mt_a").await;
        assert_eq!(removed, 2);
        assert_eq!(store.status().await.active, 1);
        assert!(store.get(b.id).await.is_some());
    }

    #[tokio::test]
    async fn reaper_evicts_only_idle_sessions() {
        let store = store_with_idle(Duration::from_millis(20));
        let idle = make_session("sk_mt_a", NamespaceId::new());
        let fresh = make_session("sk_mt_b", NamespaceId::new());

        store.insert(Arc::clone(&idle)).await;
        store.insert(Arc::clone(&fresh)).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        fresh.touch().await;

        let reaped = store.reap_idle().await;
        assert_eq!(reaped, 1);
        assert!(store.get(idle.id).await.is_none());
        assert!(store.get(fresh.id).await.is_some());
    }

    #[tokio::test]
    async fn touch_resets_idle_clock() {
        let session = make_session("sk_mt_a", NamespaceId::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.touch().await;
        assert!(session.idle_for().await < Duration::from_millis(15));
    }
}
