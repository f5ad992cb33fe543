//! Two-tier tool-response cache
//!
//! L1 is an in-process map bounded by entry count, evicting the oldest 10%
//! on overflow. L2 is an optional distributed KV with TTL, consulted only
//! for entries whose TTL exceeds one minute. L2 failures degrade the cache
//! to L1-only and are never surfaced to callers.

pub mod remote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use metamcp_shared::{NamespaceId, ServerId};

pub use remote::{RemoteKv, StoredEntry};

/// TTL above which entries are worth pushing to the distributed tier
const L2_MIN_TTL: Duration = Duration::from_secs(60);

/// Share of entries dropped when L1 overflows
const EVICT_FRACTION: usize = 10;

/// Tools that must never be cached regardless of the TTL table
const NON_CACHEABLE: &[&str] = &["login", "logout", "auth", "token", "secret", "password"];

/// Mutating verbs: any match classifies the tool as non-cacheable
const MUTATING: &[&str] = &[
    "create", "update", "delete", "remove", "execute", "write", "insert", "set_", "send", "post",
    "put", "patch", "kill", "cancel", "run_",
];

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_memory_entries: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: 1000,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Classify a tool name into its cache TTL. Unknown tools get the default.
pub fn ttl_for_tool(tool_name: &str, default_ttl: Duration) -> Duration {
    let name = tool_name.to_ascii_lowercase();

    if NON_CACHEABLE.iter().any(|n| name.contains(n)) {
        return Duration::ZERO;
    }
    if MUTATING.iter().any(|v| name.contains(v)) {
        return Duration::ZERO;
    }
    // Read-only, rarely changing material
    if ["docs", "reference", "schema", "describe", "manual"]
        .iter()
        .any(|k| name.contains(k))
    {
        return Duration::from_secs(3600);
    }
    // Dynamic listings and search
    if ["list", "search", "find", "query"].iter().any(|k| name.contains(k)) {
        return Duration::from_secs(60);
    }
    // Task state and short-lived status
    if ["status", "state", "task", "progress"]
        .iter()
        .any(|k| name.contains(k))
    {
        return Duration::from_secs(15);
    }

    default_ttl
}

/// Serialize a JSON value with object keys in sorted order at every level
fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Deterministic fingerprint of a tool-call arguments object
pub fn args_fingerprint(args: &Value) -> String {
    let canonical = canonical_json(args);
    let digest = Sha256::digest(canonical.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded[..16].to_string()
}

/// Build the cache key for one tool invocation
pub fn cache_key(
    server_id: ServerId,
    tool_name: &str,
    namespace_id: Option<NamespaceId>,
    args: &Value,
) -> String {
    let namespace = namespace_id
        .map(|n| n.to_string())
        .unwrap_or_else(|| "default".to_string());
    format!(
        "{}:{}:{}:{}",
        server_id,
        tool_name,
        namespace,
        args_fingerprint(args)
    )
}

struct L1Entry {
    payload: Value,
    cached_at: Instant,
    ttl: Duration,
    #[allow(dead_code)] // Surfaced in per-entry introspection
    hit_count: u64,
    approx_bytes: usize,
}

/// Cache health summary for /health and /metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatus {
    pub hit_rate: f64,
    pub entries: usize,
    pub memory_mb: f64,
    pub l2_connected: bool,
    pub health: &'static str,
}

pub struct ToolResponseCache {
    config: CacheConfig,
    l1: RwLock<HashMap<String, L1Entry>>,
    l2: Option<RemoteKv>,
    hits: AtomicU64,
    misses: AtomicU64,
    approx_bytes: AtomicUsize,
    l2_healthy: std::sync::atomic::AtomicBool,
}

impl ToolResponseCache {
    pub fn new(config: CacheConfig, l2: Option<RemoteKv>) -> Self {
        let has_l2 = l2.is_some();
        Self {
            config,
            l1: RwLock::new(HashMap::new()),
            l2,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            approx_bytes: AtomicUsize::new(0),
            l2_healthy: std::sync::atomic::AtomicBool::new(has_l2),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Look up a cached payload. Expired entries read as misses and are
    /// dropped. An L2 hit is promoted into L1.
    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let mut l1 = self.l1.write().await;
            match l1.get_mut(key) {
                Some(entry) if entry.cached_at.elapsed() <= entry.ttl => {
                    entry.hit_count += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {
                    if let Some(stale) = l1.remove(key) {
                        self.approx_bytes
                            .fetch_sub(stale.approx_bytes, Ordering::Relaxed);
                    }
                }
                None => {}
            }
        }

        if let Some(ref l2) = self.l2 {
            match l2.get(key).await {
                Ok(Some(stored)) => {
                    let ttl = Duration::from_secs(stored.ttl_seconds);
                    self.insert_l1(key, stored.payload.clone(), ttl).await;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.l2_healthy.store(true, Ordering::Relaxed);
                    return Some(stored.payload);
                }
                Ok(None) => {}
                Err(e) => {
                    self.l2_healthy.store(false, Ordering::Relaxed);
                    tracing::warn!(error = %e, "L2 cache get failed; continuing L1-only");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a payload. No-op for zero TTL (non-cacheable tools).
    pub async fn set(&self, key: &str, payload: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            return;
        }

        self.insert_l1(key, payload.clone(), ttl).await;

        if ttl > L2_MIN_TTL {
            if let Some(ref l2) = self.l2 {
                let stored = StoredEntry {
                    payload,
                    ttl_seconds: ttl.as_secs(),
                };
                if let Err(e) = l2.set(key, &stored, ttl).await {
                    self.l2_healthy.store(false, Ordering::Relaxed);
                    tracing::warn!(error = %e, "L2 cache set failed; continuing L1-only");
                } else {
                    self.l2_healthy.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    async fn insert_l1(&self, key: &str, payload: Value, ttl: Duration) {
        let approx_bytes = payload.to_string().len() + key.len();
        let mut l1 = self.l1.write().await;

        if let Some(old) = l1.remove(key) {
            self.approx_bytes
                .fetch_sub(old.approx_bytes, Ordering::Relaxed);
        }

        if l1.len() >= self.config.max_memory_entries {
            Self::evict_oldest(&mut l1, &self.approx_bytes, self.config.max_memory_entries);
        }

        l1.insert(
            key.to_string(),
            L1Entry {
                payload,
                cached_at: Instant::now(),
                ttl,
                hit_count: 0,
                approx_bytes,
            },
        );
        self.approx_bytes.fetch_add(approx_bytes, Ordering::Relaxed);
    }

    /// Evict the oldest 10% by insertion age
    fn evict_oldest(
        l1: &mut HashMap<String, L1Entry>,
        approx_bytes: &AtomicUsize,
        max_entries: usize,
    ) {
        let evict_count = (max_entries / EVICT_FRACTION).max(1);
        let mut by_age: Vec<(String, Instant)> = l1
            .iter()
            .map(|(k, e)| (k.clone(), e.cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);

        for (key, _) in by_age.into_iter().take(evict_count) {
            if let Some(entry) = l1.remove(&key) {
                approx_bytes.fetch_sub(entry.approx_bytes, Ordering::Relaxed);
            }
        }
    }

    /// Remove every L1 entry whose key contains `pattern`. The distributed
    /// tier is append-only from the gateway's perspective; its entries
    /// simply age out.
    pub async fn invalidate_pattern(&self, pattern: &str) {
        let mut l1 = self.l1.write().await;
        let removed: Vec<String> = l1
            .keys()
            .filter(|k| k.contains(pattern))
            .cloned()
            .collect();
        for key in removed {
            if let Some(entry) = l1.remove(&key) {
                self.approx_bytes
                    .fetch_sub(entry.approx_bytes, Ordering::Relaxed);
            }
        }
    }

    /// Periodic sweep dropping expired L1 entries
    pub async fn sweep_expired(&self) {
        let mut l1 = self.l1.write().await;
        let expired: Vec<String> = l1
            .iter()
            .filter(|(_, e)| e.cached_at.elapsed() > e.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = l1.remove(&key) {
                self.approx_bytes
                    .fetch_sub(entry.approx_bytes, Ordering::Relaxed);
            }
        }
    }

    pub async fn status(&self) -> CacheStatus {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            1.0
        } else {
            hits as f64 / total as f64
        };

        let health = if hit_rate >= 0.8 {
            "ok"
        } else if hit_rate >= 0.5 {
            "degraded"
        } else {
            "error"
        };

        CacheStatus {
            hit_rate,
            entries: self.l1.read().await.len(),
            memory_mb: self.approx_bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
            l2_connected: self.l2.is_some() && self.l2_healthy.load(Ordering::Relaxed),
            health,
        }
    }
}
