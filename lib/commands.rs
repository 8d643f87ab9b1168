use crate::{
    build_info,
    chain_client::ChainClient,
    config::Config,
    db::build_db_pool,
    logging::{format_error_report, init_logging},
    server::setup_server_with_addr,
    state::AppState,
    sync_service::SyncService,
};
use clap::Parser;
use dotenv::dotenv;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DB_POOL_MAX_SIZE_CAP: usize = 64;

/// CLI surface for the bounded batch ingestion run.
#[derive(Debug, Parser, Clone)]
#[command(
    about = "Run one bounded batch ingestion pass and exit",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct BatchArgs {
    #[arg(long = "database-url")]
    pub database_url: Option<String>,
    #[arg(long = "chain-api-url")]
    pub chain_api_url: Option<String>,

    #[arg(long = "start-height")]
    /// Resume from this height instead of the recorded frontier.
    pub start_height: Option<i64>,
    #[arg(long = "end-height")]
    /// Stop the window at this height even if the source tip is higher.
    pub end_height: Option<i64>,
    #[arg(long = "genesis")]
    /// Lowest height the store is expected to contain.
    pub genesis: Option<i64>,
    #[arg(long = "batch-size")]
    pub batch_size: Option<i64>,
    #[arg(long = "workers", alias = "num-workers")]
    pub workers: Option<usize>,
    #[arg(long = "skip-gaps", default_value_t = false)]
    /// Skip gap detection and repair after the ingestion window completes.
    pub skip_gaps: bool,

    #[arg(long = "retry-attempts")]
    pub retry_attempts: Option<u32>,
    #[arg(long = "retry-initial-ms")]
    pub retry_initial_ms: Option<u64>,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    #[arg(long = "metrics-bind", default_value = "0.0.0.0:3000")]
    pub metrics_bind: String,
}

/// Cancels the supplied token when SIGTERM or SIGINT is received.
pub async fn handle_shutdown_signals(cancel_token: CancellationToken) {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to register SIGTERM signal handler");
    let mut sigint =
        signal(SignalKind::interrupt()).expect("Failed to register SIGINT signal handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "shutting down");
        }
    }

    cancel_token.cancel();
}

fn resolve_database_url(args: &BatchArgs) -> Result<String, String> {
    if let Some(value) = &args.database_url {
        return Ok(value.clone());
    }

    env::var("DATABASE_URL")
        .map_err(|_| "DATABASE_URL is required (env var or --database-url)".to_string())
}

pub fn resolve_db_pool_max_size(worker_count: usize) -> usize {
    worker_count.min(DB_POOL_MAX_SIZE_CAP).max(1)
}

pub fn validate_batch_args(args: &BatchArgs) -> Result<(), String> {
    if let Some(batch_size) = args.batch_size {
        if batch_size <= 0 {
            return Err(format!("--batch-size must be > 0, got {batch_size}"));
        }
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err("--workers/--num-workers must be > 0".to_string());
        }
    }
    if let Some(genesis) = args.genesis {
        if genesis < 0 {
            return Err(format!("--genesis must be >= 0, got {genesis}"));
        }
    }
    if let Some(start_height) = args.start_height {
        if start_height < 0 {
            return Err(format!("--start-height must be >= 0, got {start_height}"));
        }
        if let Some(genesis) = args.genesis {
            if start_height < genesis {
                return Err(format!(
                    "--start-height ({start_height}) must be >= --genesis ({genesis})"
                ));
            }
        }
    }
    if let Some(end_height) = args.end_height {
        if end_height < 0 {
            return Err(format!("--end-height must be >= 0, got {end_height}"));
        }
        if let Some(start_height) = args.start_height {
            if end_height < start_height {
                return Err(format!(
                    "--end-height ({end_height}) must be >= --start-height ({start_height})"
                ));
            }
        }
    }
    if let Some(retry_attempts) = args.retry_attempts {
        if retry_attempts == 0 {
            return Err("--retry-attempts must be > 0".to_string());
        }
    }
    args.metrics_bind.parse::<SocketAddr>().map_err(|err| {
        format!(
            "invalid --metrics-bind address `{}`: {err}",
            args.metrics_bind
        )
    })?;

    Ok(())
}

fn apply_config_overrides(config: &mut Config, args: &BatchArgs) {
    if let Some(chain_api_url) = &args.chain_api_url {
        config.chain_api_url = chain_api_url.clone();
    }
    if let Some(genesis) = args.genesis {
        config.genesis_height = genesis;
    }
    if let Some(retry_attempts) = args.retry_attempts {
        config.max_retries = retry_attempts;
    }
    if let Some(retry_initial_ms) = args.retry_initial_ms {
        config.block_fetch_delay = Duration::from_millis(retry_initial_ms);
    }
}

/// Runs one batch ingestion pass and returns the process exit code.
///
/// Exit codes: `0` clean run, `1` the run failed or left unresolved heights
/// behind, `2` the invocation itself was invalid.
pub async fn run_batch_once(args: BatchArgs, logging_mode: &str) -> i32 {
    dotenv().ok();

    let logging_context = init_logging("block_indexer", logging_mode, &args.log_level);
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
    info!(
        event = "batch_ingest_starting",
        mode = logging_mode,
        "starting batch ingestion run"
    );

    if let Err(err) = validate_batch_args(&args) {
        eprintln!("{err}");
        return 2;
    }

    let db_url = match resolve_database_url(&args) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    let mut config = match Config::from_env_with_db_url(db_url) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return 2;
        }
    };
    apply_config_overrides(&mut config, &args);

    let worker_count = args.workers.unwrap_or(config.num_workers).max(1);
    let pool = match build_db_pool(&config.db_url, resolve_db_pool_max_size(worker_count)).await {
        Ok(value) => value,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "batch_db_pool_build_failed",
                error = %err,
                error_report = %error_report,
                "failed to build db pool"
            );
            eprintln!("failed to build db pool: {err}");
            return 1;
        }
    };

    let chain = match ChainClient::new(config.chain_api_url.clone(), config.api_timeout) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("failed to build block source client: {err}");
            return 1;
        }
    };

    // SIGTERM/SIGINT drain the run: no new heights or repair claims are
    // started, in-flight work completes, and the exit code reflects what
    // the interrupted run left behind.
    let cancel_token = CancellationToken::new();
    let signal_handle = tokio::spawn(handle_shutdown_signals(cancel_token.clone()));

    let metrics_addr = match args.metrics_bind.parse::<SocketAddr>() {
        Ok(value) => value,
        Err(_) => return 2,
    };
    let app_state = Arc::new(AppState::new(pool.clone(), chain, cancel_token.clone()));
    let metrics_server_handle = match setup_server_with_addr(app_state, metrics_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "batch_metrics_server_start_failed",
                bind = %metrics_addr,
                error = %err,
                error_report = %error_report,
                "failed to start metrics endpoint"
            );
            eprintln!("failed to start metrics endpoint on {metrics_addr}: {err}");
            return 1;
        }
    };

    let service = SyncService::new(config, pool);
    let result = service
        .batch_run(
            args.start_height,
            args.end_height,
            args.batch_size,
            args.workers,
            args.skip_gaps,
            cancel_token.clone(),
        )
        .await;

    signal_handle.abort();
    metrics_server_handle.abort();

    let summary = match result {
        Ok(summary) => summary,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "batch_ingest_failed",
                error = %err,
                error_report = %error_report,
                "batch ingestion run failed"
            );
            eprintln!("batch ingestion failed: {err}");
            eprintln!("{error_report}");
            return 1;
        }
    };

    info!(
        event = "batch_ingest_complete",
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        not_yet_available = summary.not_yet_available,
        failed = summary.failed,
        unresolved = summary.unresolved,
        gaps_detected = summary.gaps_detected,
        gaps_resolved = summary.gaps_resolved,
        gaps_stuck = summary.gaps_stuck,
        gaps_still_open = summary.gaps_still_open,
        "batch ingestion run completed"
    );

    if !summary.is_clean() {
        warn!(
            event = "batch_ingest_unclean",
            unresolved = summary.unresolved,
            gaps_stuck = summary.gaps_stuck,
            gaps_still_open = summary.gaps_still_open,
            "batch run completed with unresolved heights"
        );
        return 1;
    }

    0
}
