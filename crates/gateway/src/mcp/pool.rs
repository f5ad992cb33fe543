//! Per-API-key upstream connection pool
//!
//! One pooled upstream client per (API key, server) pair. Buckets group the
//! connections of a single API key; destroying a bucket destroys all of its
//! connections. Operations on one bucket are serialized by the bucket lock;
//! distinct buckets proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use metamcp_shared::{ApiKeyId, McpServer, ServerId, ServerParams};

use super::client::{CrashCallback, McpClientError, RequestTimeouts, UpstreamClient};
use super::error_tracker::ErrorTracker;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Upstream launch cooldown active")]
    CooldownActive,

    #[error("Server is in error state; reset required")]
    ServerInErrorState,

    #[error("Per-key connection limit reached")]
    PerKeyLimit,

    #[error("Global connection limit reached")]
    GlobalLimit,

    #[error("Upstream connection failed: {0}")]
    Connect(#[from] McpClientError),

    #[error("Repository error: {0}")]
    Repo(#[from] crate::repo::RepoError),
}

/// Pool policy knobs; all configurable via [`crate::config::Config`]
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_idle_time: Duration,
    pub cleanup_interval: Duration,
    pub max_connections_per_key: usize,
    pub max_global_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(30 * 60),
            max_connections_per_key: 50,
            max_global_connections: 100,
        }
    }
}

struct PooledConnection {
    client: Arc<UpstreamClient>,
    #[allow(dead_code)] // Surfaced in pool introspection
    created_at: Instant,
    last_access: Instant,
}

struct Bucket {
    key_id: ApiKeyId,
    connections: HashMap<ServerId, PooledConnection>,
    #[allow(dead_code)] // Surfaced in pool introspection
    created_at: Instant,
    last_access: Instant,
}

/// Point-in-time pool counters for /health and /metrics
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStatus {
    pub buckets: usize,
    pub upstreams: usize,
}

pub struct ConnectionPool {
    config: PoolConfig,
    timeouts: RequestTimeouts,
    tracker: Arc<ErrorTracker>,
    /// api-key secret -> bucket. Lock order: map first, then bucket.
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    /// Latest known launch params per server, refreshed on invalidation
    params_cache: RwLock<HashMap<ServerId, ServerParams>>,
    total_connections: AtomicUsize,
    /// Identity handle handed to crash callbacks; never a strong cycle
    self_ref: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        timeouts: RequestTimeouts,
        tracker: Arc<ErrorTracker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            timeouts,
            tracker,
            buckets: RwLock::new(HashMap::new()),
            params_cache: RwLock::new(HashMap::new()),
            total_connections: AtomicUsize::new(0),
            self_ref: weak.clone(),
        })
    }

    /// Acquire the pooled upstream for `(api_key, server)`, connecting lazily.
    ///
    /// Reuses a live entry when present (refreshing its access time).
    /// Enforces the global and per-key caps, the launch cooldown, and the
    /// persisted error state before spawning anything.
    pub async fn get_connection(
        &self,
        api_key: &str,
        key_id: ApiKeyId,
        server: &McpServer,
    ) -> Result<Arc<UpstreamClient>, PoolError> {
        let bucket = self.bucket_for(api_key, key_id).await;
        let mut guard = bucket.lock().await;
        guard.last_access = Instant::now();

        if let Some(entry) = guard.connections.get_mut(&server.id) {
            entry.last_access = Instant::now();
            return Ok(Arc::clone(&entry.client));
        }

        if self.tracker.is_server_in_error_state(server.id).await? {
            return Err(PoolError::ServerInErrorState);
        }

        // Prefer params updated through invalidation over the caller's copy
        let params = {
            let cache = self.params_cache.read().await;
            cache.get(&server.id).cloned().unwrap_or_else(|| server.params.clone())
        };

        if self.tracker.cooldown_active(&params).await {
            return Err(PoolError::CooldownActive);
        }

        if guard.connections.len() >= self.config.max_connections_per_key {
            return Err(PoolError::PerKeyLimit);
        }
        if self.total_connections.load(Ordering::SeqCst) >= self.config.max_global_connections {
            return Err(PoolError::GlobalLimit);
        }

        let client = match UpstreamClient::connect(
            &server.name,
            &params,
            self.timeouts,
            self.crash_callback(api_key, server.id, &params),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(
                    server_uuid = %server.id,
                    api_key_uuid = %key_id,
                    error = %e,
                    "upstream connect failed"
                );
                self.tracker.record_launch_failure(&params).await;
                return Err(PoolError::Connect(e));
            }
        };

        guard.connections.insert(
            server.id,
            PooledConnection {
                client: Arc::clone(&client),
                created_at: Instant::now(),
                last_access: Instant::now(),
            },
        );
        self.total_connections.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            server_uuid = %server.id,
            api_key_uuid = %key_id,
            total = self.total_connections.load(Ordering::SeqCst),
            "upstream connection established"
        );

        Ok(client)
    }

    async fn bucket_for(&self, api_key: &str, key_id: ApiKeyId) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(api_key) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().await;
        Arc::clone(buckets.entry(api_key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                key_id,
                connections: HashMap::new(),
                created_at: Instant::now(),
                last_access: Instant::now(),
            }))
        }))
    }

    /// The crash hook stores (api_key, server_uuid) identity, never a bucket
    /// back-pointer; it looks the bucket up again when it fires.
    fn crash_callback(
        &self,
        api_key: &str,
        server_id: ServerId,
        params: &ServerParams,
    ) -> CrashCallback {
        let pool = self.self_ref.clone();
        let api_key = api_key.to_string();
        let params = params.clone();

        Arc::new(move |exit_code, signal| {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let api_key = api_key.clone();
            let params = params.clone();

            tokio::spawn(async move {
                tracing::warn!(
                    server_uuid = %server_id,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "upstream crashed"
                );
                pool.tracker.record_crash(server_id, &params).await;
                pool.remove_connection(&api_key, server_id).await;
            });
        })
    }

    /// Drop one entry without closing (the process is already gone).
    /// Destroys the bucket when it becomes empty.
    async fn remove_connection(&self, api_key: &str, server_id: ServerId) {
        let bucket = {
            let buckets = self.buckets.read().await;
            buckets.get(api_key).cloned()
        };
        let Some(bucket) = bucket else { return };

        let empty = {
            let mut guard = bucket.lock().await;
            if guard.connections.remove(&server_id).is_some() {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
            guard.connections.is_empty()
        };

        if empty {
            let mut buckets = self.buckets.write().await;
            // Re-check under the write lock; another task may have refilled it
            if let Some(bucket) = buckets.get(api_key) {
                if bucket.lock().await.connections.is_empty() {
                    buckets.remove(api_key);
                }
            }
        }
    }

    /// Close and remove this server's connections in every bucket, then
    /// remember the new launch params for future acquisitions.
    pub async fn invalidate_server_connections(
        &self,
        server_id: ServerId,
        new_params: ServerParams,
    ) {
        self.close_server_everywhere(server_id).await;
        self.params_cache.write().await.insert(server_id, new_params);
    }

    /// Same as invalidation but the server is gone for good
    pub async fn cleanup_server_connections(&self, server_id: ServerId) {
        self.close_server_everywhere(server_id).await;
        self.params_cache.write().await.remove(&server_id);
    }

    async fn close_server_everywhere(&self, server_id: ServerId) {
        let buckets: Vec<_> = {
            let map = self.buckets.read().await;
            map.values().cloned().collect()
        };

        for bucket in buckets {
            let removed = {
                let mut guard = bucket.lock().await;
                guard.connections.remove(&server_id)
            };
            if let Some(entry) = removed {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                entry.client.close().await;
            }
        }
    }

    /// Close every connection of one API key and delete the bucket
    pub async fn cleanup_api_key(&self, api_key: &str) {
        let bucket = self.buckets.write().await.remove(api_key);
        let Some(bucket) = bucket else { return };
        self.drain_bucket(bucket).await;
    }

    /// Periodic task: evict buckets idle past `max_idle_time`
    pub async fn perform_time_based_cleanup(&self) {
        let max_idle = self.config.max_idle_time;
        let expired: Vec<(String, Arc<Mutex<Bucket>>)> = {
            let mut buckets = self.buckets.write().await;
            let mut expired = Vec::new();
            let mut keep = HashMap::new();
            for (key, bucket) in buckets.drain() {
                let idle = bucket.lock().await.last_access.elapsed();
                if idle > max_idle {
                    expired.push((key, bucket));
                } else {
                    keep.insert(key, bucket);
                }
            }
            *buckets = keep;
            expired
        };

        for (key, bucket) in expired {
            let key_id = bucket.lock().await.key_id;
            tracing::info!(api_key_uuid = %key_id, key = %crate::auth::display_prefix(&key), "evicting idle bucket");
            self.drain_bucket(bucket).await;
        }
    }

    /// Shutdown hook: drain everything
    pub async fn cleanup_all(&self) {
        let buckets: Vec<_> = self.buckets.write().await.drain().map(|(_, b)| b).collect();
        for bucket in buckets {
            self.drain_bucket(bucket).await;
        }
    }

    async fn drain_bucket(&self, bucket: Arc<Mutex<Bucket>>) {
        let connections: Vec<PooledConnection> = {
            let mut guard = bucket.lock().await;
            guard.connections.drain().map(|(_, c)| c).collect()
        };
        for entry in connections {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            // Individual close failures must not abort the cleanup loop
            entry.client.close().await;
        }
    }

    pub async fn status(&self) -> PoolStatus {
        PoolStatus {
            buckets: self.buckets.read().await.len(),
            upstreams: self.total_connections.load(Ordering::SeqCst),
        }
    }

    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }
}
