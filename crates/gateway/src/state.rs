//! Shared application state

use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use crate::aggregate::ServerFactory;
use crate::cache::ToolResponseCache;
use crate::config::Config;
use crate::mcp::pool::ConnectionPool;
use crate::repo::Repository;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub pool: Arc<ConnectionPool>,
    pub cache: Arc<ToolResponseCache>,
    pub sessions: Arc<SessionStore>,
    pub factory: Arc<ServerFactory>,
    /// Present only when backed by Postgres; used for /health reporting
    pub db: Option<PgPool>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        repo: Arc<dyn Repository>,
        pool: Arc<ConnectionPool>,
        cache: Arc<ToolResponseCache>,
        sessions: Arc<SessionStore>,
        db: Option<PgPool>,
    ) -> Self {
        let factory = Arc::new(ServerFactory::new(
            Arc::clone(&repo),
            Arc::clone(&pool),
            Arc::clone(&cache),
        ));
        Self {
            config,
            repo,
            pool,
            cache,
            sessions,
            factory,
            db,
            started_at: Instant::now(),
        }
    }
}
