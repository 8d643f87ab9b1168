use std::sync::Arc;

use diesel_async::{pg::AsyncPgConnection, pooled_connection::deadpool::Pool};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::chain_client::ChainClient;

/// Shared handles for the monitoring server: the async DB pool, the block
/// source client used by the readiness probe, the process shutdown token, and
/// the metrics registry.
pub struct AppState {
    pub pool: Pool<AsyncPgConnection>,
    pub chain: Arc<ChainClient>,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(
        pool: Pool<AsyncPgConnection>,
        chain: Arc<ChainClient>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            pool,
            chain,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
