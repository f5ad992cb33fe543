//! MetaMCP gateway entrypoint

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use metamcp_gateway::cache::{RemoteKv, ToolResponseCache};
use metamcp_gateway::config::Config;
use metamcp_gateway::mcp::error_tracker::ErrorTracker;
use metamcp_gateway::mcp::pool::ConnectionPool;
use metamcp_gateway::repo::{MemoryRepository, PgRepository, Repository};
use metamcp_gateway::routes::create_router;
use metamcp_gateway::session::SessionStore;
use metamcp_gateway::startup;
use metamcp_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());

    let (repo, db): (Arc<dyn Repository>, _) = match config.database_url.as_deref() {
        Some(url) => {
            let pool = metamcp_shared::create_pool(url).await?;
            tracing::info!("connected to database");
            (Arc::new(PgRepository::new(pool.clone())), Some(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; running with in-memory repository");
            (Arc::new(MemoryRepository::new()), None)
        }
    };

    let tracker = Arc::new(ErrorTracker::new(Arc::clone(&repo), config.stdio_cooldown()));
    let pool = ConnectionPool::new(config.pool_config(), config.request_timeouts(), tracker);

    let l2 = match (&config.cache_l2_url, &config.cache_l2_token) {
        (Some(url), token) => match RemoteKv::new(url.clone(), token.clone()) {
            Ok(kv) => {
                tracing::info!("distributed cache tier configured");
                Some(kv)
            }
            Err(e) => {
                tracing::warn!(error = %e, "L2 cache unavailable; running L1-only");
                None
            }
        },
        _ => None,
    };
    let cache = Arc::new(ToolResponseCache::new(config.cache_config(), l2));

    let sessions = Arc::new(SessionStore::new(config.session_config()));
    let state = AppState::new(
        Arc::clone(&config),
        repo,
        pool,
        cache,
        sessions,
        db,
    );

    let maintenance = startup::spawn_maintenance(&state);

    // Defer the first outbound request so callback-reconnecting upstreams
    // do not race the listener.
    let warm_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(startup::WARM_START_DELAY).await;
        startup::warm_upstream_connections(&warm_state).await;
    });

    let listener = tokio::net::TcpListener::bind(config.bind_address.as_str()).await?;
    tracing::info!(address = %config.bind_address, "MetaMCP gateway listening");

    let router = create_router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    startup::shutdown(&state, maintenance).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
