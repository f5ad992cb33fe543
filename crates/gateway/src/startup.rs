//! Boot-time orchestration
//!
//! Builds the shared state, warms idle upstream connections for defined
//! servers under a reserved system identity, runs the periodic maintenance
//! tasks, and drains everything on shutdown.

use std::sync::Arc;
use std::time::Duration;

use metamcp_shared::{ApiKeyId, ErrorStatus};

use crate::state::AppState;

/// Reserved bucket identity for boot-time idle-warm connections.
/// Not a client credential; it never passes API-key validation.
const SYSTEM_WARM_KEY: &str = "internal:system-warm";

/// Delay before the first outbound request after the HTTP listener binds,
/// so clients that reconnect via callback do not race the listener.
pub const WARM_START_DELAY: Duration = Duration::from_secs(3);

/// Eagerly establish one system-scoped connection per healthy server to
/// amortize cold-start latency.
pub async fn warm_upstream_connections(state: &AppState) {
    let servers = match state.repo.all_servers().await {
        Ok(servers) => servers,
        Err(e) => {
            tracing::error!(error = %e, "warm-up skipped: server listing failed");
            return;
        }
    };

    let system_key_id = ApiKeyId::new();
    let mut warmed = 0usize;
    for server in servers {
        if server.error_status == ErrorStatus::Error {
            continue;
        }
        match state
            .pool
            .get_connection(SYSTEM_WARM_KEY, system_key_id, &server)
            .await
        {
            Ok(_) => warmed += 1,
            Err(e) => {
                tracing::warn!(
                    server_uuid = %server.id,
                    error = %e,
                    "warm-up connection failed"
                );
            }
        }
    }

    tracing::info!(count = warmed, "idle-warm upstream connections established");
}

/// Spawn the periodic maintenance loops. The returned handles are aborted
/// on shutdown.
pub fn spawn_maintenance(state: &AppState) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Session idle reaper
    {
        let sessions = Arc::clone(&state.sessions);
        let interval = sessions.config().cleanup_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                sessions.reap_idle().await;
            }
        }));
    }

    // Pool idle-bucket eviction
    {
        let pool = Arc::clone(&state.pool);
        let interval = state.config.pool_config().cleanup_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.perform_time_based_cleanup().await;
            }
        }));
    }

    // Expired cache entries and stale cooldowns
    {
        let cache = Arc::clone(&state.cache);
        let pool = Arc::clone(&state.pool);
        let interval = state.config.cache_config().cleanup_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
                pool.error_tracker().sweep().await;
            }
        }));
    }

    handles
}

/// Graceful shutdown: stop maintenance, close sessions, drain buckets,
/// flush caches.
pub async fn shutdown(state: &AppState, maintenance: Vec<tokio::task::JoinHandle<()>>) {
    tracing::info!("shutting down");
    for handle in maintenance {
        handle.abort();
    }
    state.sessions.close_all().await;
    state.pool.cleanup_all().await;
    state.cache.sweep_expired().await;
    tracing::info!("shutdown complete");
}
