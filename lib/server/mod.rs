pub mod monitoring;

use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::http::StatusCode;
use axum::{extract::State, routing::get, Router};
use diesel_async::RunQueryDsl;
use monitoring::INDEXER_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;

/// Reports readiness: healthy only while both a control-plane database round
/// trip and a block source reachability probe succeed.
async fn health_handler(state: State<Arc<AppState>>) -> (StatusCode, String) {
    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("database pool unavailable: {err}"),
            )
        }
    };
    if let Err(err) = diesel::sql_query("SELECT 1").execute(&mut conn).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("database query failed: {err}"),
        );
    }

    if !state.chain.check_health().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "block source unreachable".to_string(),
        );
    }

    (StatusCode::OK, "Healthy".to_string())
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// Starts the health/metrics HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    {
        let mut registry = state.registry.write().await;

        INDEXER_METRICS
            .get_or_init(|| async { monitoring::IndexerMetrics::register(&mut registry, "indexer") })
            .await;

        monitoring::register_build_info_metric(&mut registry, "indexer");
    }

    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/", get(|| async { "block indexer" }))
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;

        if let Err(err) = served {
            tracing::error!(
                event = "monitoring_server_failed",
                error = %err,
                "health/metrics server exited with an error"
            );
        }
    });

    Ok(server_handle)
}
