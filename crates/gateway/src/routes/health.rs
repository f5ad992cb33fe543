//! Health and metrics endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::cache::CacheStatus;
use crate::mcp::pool::PoolStatus;
use crate::session::SessionStatus;
use crate::state::AppState;

#[derive(Serialize)]
pub struct PoolsSnapshot {
    pub db: u32,
    pub upstreams: usize,
    pub buckets: usize,
    pub sessions: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cache: CacheStatus,
    pub pools: PoolsSnapshot,
    pub memory_mb: f64,
}

async fn snapshot(state: &AppState) -> (bool, HealthResponse) {
    let db_healthy = match &state.db {
        Some(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        None => true, // in-memory repository has nothing to probe
    };

    let cache: CacheStatus = state.cache.status().await;
    let pool: PoolStatus = state.pool.status().await;
    let sessions: SessionStatus = state.sessions.status().await;

    let healthy = db_healthy;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cache,
        pools: PoolsSnapshot {
            db: state.db.as_ref().map(|p| p.size()).unwrap_or(0),
            upstreams: pool.upstreams,
            buckets: pool.buckets,
            sessions: sessions.active,
        },
        memory_mb: process_memory_mb(),
    };
    (healthy, response)
}

/// Health check endpoint: 200 when healthy, 503 when degraded
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (healthy, response) = snapshot(&state).await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Structured JSON snapshot of the same data
pub async fn metrics(State(state): State<AppState>) -> Json<HealthResponse> {
    let (_, response) = snapshot(&state).await;
    Json(response)
}

/// Resident set size of this process, best effort
fn process_memory_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                let page_size = 4096u64;
                return (rss_pages * page_size) as f64 / (1024.0 * 1024.0);
            }
        }
    }
    0.0
}
