use block_indexer_lib::{
    chain_client::ChainClient,
    cli::parse_args,
    commands::{handle_shutdown_signals, resolve_db_pool_max_size},
    config::Config,
    db::build_db_pool,
    logging::{format_error_report, init_logging},
    server::setup_server_with_addr,
    state::AppState,
    sync_service::SyncService,
};
use diesel::{pg::PgConnection, Connection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use dotenv::dotenv;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn run_initial_migrations(
    connection: &mut impl MigrationHarness<diesel::pg::Pg>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    connection.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let args = parse_args();
    let logging_context = init_logging("block_indexer", "daemon", &args.log_level);
    let run_span = tracing::info_span!(
        "indexer_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();
    info!(event = "daemon_starting", "starting block indexer daemon");

    let metrics_addr = match args.metrics_bind.parse::<SocketAddr>() {
        Ok(value) => value,
        Err(err) => {
            eprintln!(
                "invalid --metrics-bind address `{}`: {err}",
                args.metrics_bind
            );
            std::process::exit(2);
        }
    };

    let config = match Config::from_env() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let migration_result = PgConnection::establish(&config.db_url)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)
        .and_then(|mut conn| run_initial_migrations(&mut conn));
    if let Err(err) = migration_result {
        let error_report = format_error_report(err.as_ref());
        error!(
            event = "migrations_failed",
            error = %err,
            error_report = %error_report,
            "failed to run database migrations"
        );
        eprintln!("failed to run database migrations: {err}");
        std::process::exit(1);
    }

    let pool = match build_db_pool(&config.db_url, resolve_db_pool_max_size(config.num_workers)).await
    {
        Ok(value) => value,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "db_pool_build_failed",
                error = %err,
                error_report = %error_report,
                "failed to build db pool"
            );
            eprintln!("failed to build db pool: {err}");
            std::process::exit(1);
        }
    };

    let chain = match ChainClient::new(config.chain_api_url.clone(), config.api_timeout) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("failed to build block source client: {err}");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(pool.clone(), chain, CancellationToken::new()));
    let shutdown_handle = tokio::spawn(handle_shutdown_signals(state.shutdown_token.clone()));

    let server_handle = match setup_server_with_addr(state.clone(), metrics_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "metrics_server_start_failed",
                bind = %metrics_addr,
                error = %err,
                error_report = %error_report,
                "failed to start metrics endpoint"
            );
            eprintln!("failed to start metrics endpoint on {metrics_addr}: {err}");
            std::process::exit(1);
        }
    };

    let service = SyncService::new(config, pool);
    let run_result = service
        .continuous_run(
            state.shutdown_token.clone(),
            !args.no_collector,
            !args.no_gap_repair,
        )
        .await;

    state.shutdown_token.cancel();
    let _ = shutdown_handle.await;
    server_handle.abort();

    if let Err(err) = run_result {
        let error_report = format_error_report(&err);
        error!(
            event = "daemon_failed",
            error = %err,
            error_report = %error_report,
            "block indexer daemon exited with an error"
        );
        eprintln!("block indexer failed: {err}");
        std::process::exit(1);
    }

    info!(event = "daemon_stopped", "block indexer daemon stopped");
}
