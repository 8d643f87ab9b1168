mod broker;
mod collector;
mod error;
mod gap_repair;
mod orchestrator;
pub mod types;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use diesel_async::pooled_connection::deadpool::Pool;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use broker::{PgSequenceBroker, SequenceBroker};
#[cfg(any(test, feature = "sqlite-tests"))]
pub use broker::SqliteSequenceBroker;
pub use collector::{Collector, CollectorConfig};
pub use error::Error;
pub use gap_repair::{GapRepairConfig, GapRepairSummary, GapRepairer};
pub use orchestrator::{BatchConfig, BatchOrchestrator};

use crate::config::Config;
use crate::server::monitoring::INDEXER_METRICS;
use types::{BatchRunSummary, GapRepairPolicy, GlobalRateLimiter, IngestWorkerConfig, RetryPolicy, StorageBackend};
use worker::{BlockPersister, FileBlockPersister, HttpBlockFetcher, PgBlockPersister};

/// Upper bound on upstream requests per second shared by every worker in the process.
const GLOBAL_REQUESTS_PER_SECOND: u32 = 100;

/// Wires configuration into brokers, fetchers, and storage backends, and
/// exposes the two deployment shapes: bounded batch runs and the continuous
/// collector daemon.
pub struct SyncService {
    config: Config,
    db_pool: Pool<diesel_async::AsyncPgConnection>,
    broker: Arc<dyn SequenceBroker>,
    rate_limiter: GlobalRateLimiter,
}

impl SyncService {
    pub fn new(config: Config, db_pool: Pool<diesel_async::AsyncPgConnection>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(nonzero!(
            GLOBAL_REQUESTS_PER_SECOND
        ))));
        let broker = Arc::new(PgSequenceBroker::new(config.db_url.clone()));
        Self {
            config,
            db_pool,
            broker,
            rate_limiter,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_retries.max(1),
            initial_backoff: self.config.block_fetch_delay,
            ..RetryPolicy::default()
        }
    }

    fn ingest_worker_config(&self) -> IngestWorkerConfig {
        IngestWorkerConfig {
            retry_policy: self.retry_policy(),
        }
    }

    fn build_fetcher(&self) -> Result<Arc<HttpBlockFetcher>, Error> {
        let fetcher = HttpBlockFetcher::new(
            self.config.chain_api_url.clone(),
            self.config.api_timeout,
            Arc::clone(&self.rate_limiter),
        )
        .map_err(|err| Error::ConnectError(err.message))?;
        Ok(Arc::new(fetcher))
    }

    fn build_backends(&self) -> Result<Vec<(StorageBackend, Arc<dyn BlockPersister>)>, Error> {
        let mut backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)> = Vec::new();

        if self.config.storage.db_enabled {
            backends.push((
                StorageBackend::Database,
                Arc::new(PgBlockPersister::new(self.db_pool.clone())),
            ));
        }

        if self.config.storage.file_enabled {
            let extension = self
                .config
                .storage
                .file_extension
                .then(|| "json".to_string());
            let persister = FileBlockPersister::new(
                self.config.storage.file_dir.clone(),
                extension,
                self.config.storage.file_pretty_json,
            )
            .map_err(|err| Error::Orchestration(err.message))?;
            backends.push((StorageBackend::File, Arc::new(persister)));
        }

        if backends.is_empty() {
            return Err(Error::Orchestration(
                "no storage backend enabled".to_string(),
            ));
        }

        Ok(backends)
    }

    fn gap_repair_config(&self) -> GapRepairConfig {
        GapRepairConfig {
            worker_count: self.config.num_workers.max(1),
            queue_capacity: self.config.num_workers.max(1).saturating_mul(2),
            policy: GapRepairPolicy::default(),
            ingest_worker: self.ingest_worker_config(),
        }
    }

    /// Runs one bounded batch ingestion pass and returns its summary.
    ///
    /// Cancelling the token drains the run early: no new heights or repair
    /// claims are started, in-flight work completes, and the summary still
    /// reports what the run left behind.
    pub async fn batch_run(
        &self,
        start_height: Option<i64>,
        end_height: Option<i64>,
        batch_size: Option<i64>,
        worker_count: Option<usize>,
        skip_gaps: bool,
        cancel_token: CancellationToken,
    ) -> Result<BatchRunSummary, Error> {
        let fetcher = self.build_fetcher()?;
        let backends = self.build_backends()?;

        let orchestrator = BatchOrchestrator::new(
            Arc::clone(&self.broker),
            fetcher.clone(),
            fetcher,
            backends,
            BatchConfig {
                batch_size: batch_size.unwrap_or(self.config.batch_size),
                worker_count: worker_count.unwrap_or(self.config.num_workers).max(1),
                genesis: self.config.genesis_height,
                start_height,
                end_height,
                skip_gaps,
                max_gaps_per_pass: self.config.max_gaps_per_pass,
                ingest_worker: self.ingest_worker_config(),
                gap_repair: self.gap_repair_config(),
            },
        );

        let summary = orchestrator.run(cancel_token).await?;
        self.report_stuck_gaps().await?;
        Ok(summary)
    }

    /// Runs the continuous deployment shape until cancelled: a tip-following
    /// collector plus a periodic gap detection and repair loop.
    pub async fn continuous_run(
        &self,
        cancel_token: CancellationToken,
        collector_enabled: bool,
        gap_repair_enabled: bool,
    ) -> Result<(), Error> {
        let requeued = self.broker.requeue_in_flight_gaps().await?;
        if requeued > 0 {
            info!(
                event = "in_flight_gaps_requeued",
                requeued, "returned crashed in-flight gap ranges to pending"
            );
        }

        let fetcher = self.build_fetcher()?;
        let backends = self.build_backends()?;

        let mut tasks: Vec<tokio::task::JoinHandle<Result<(), Error>>> = Vec::new();

        if collector_enabled {
            let collector = Collector::new(
                Arc::clone(&self.broker),
                fetcher.clone(),
                fetcher.clone(),
                backends.clone(),
                CollectorConfig {
                    genesis: self.config.genesis_height,
                    block_fetch_delay: self.config.block_fetch_delay,
                    poll_interval: self.config.block_fetch_delay,
                    ingest_worker: self.ingest_worker_config(),
                    ..CollectorConfig::default()
                },
            );
            let collector_cancel = cancel_token.clone();
            tasks.push(tokio::spawn(async move {
                collector.run(collector_cancel).await
            }));
        }

        if gap_repair_enabled {
            let repairer = GapRepairer::new(
                Arc::clone(&self.broker),
                fetcher.clone(),
                backends.clone(),
                self.gap_repair_config(),
            );
            let broker = Arc::clone(&self.broker);
            let genesis = self.config.genesis_height;
            let max_gaps = self.config.max_gaps_per_pass;
            let scan_interval = self.config.gap_scan_interval;
            let repair_cancel = cancel_token.clone();
            tasks.push(tokio::spawn(async move {
                run_gap_maintenance_loop(
                    broker,
                    repairer,
                    genesis,
                    max_gaps,
                    scan_interval,
                    repair_cancel,
                )
                .await
            }));
        }

        if tasks.is_empty() {
            warn!(
                event = "sync_service_idle",
                "both the collector and gap repair are disabled; nothing to run"
            );
            cancel_token.cancelled().await;
            return Ok(());
        }

        // The first task to finish decides the outcome: on error, cancel the
        // rest and propagate; on cancellation, drain the remainder cleanly.
        let mut result = Ok(());
        let mut remaining = tasks;
        while !remaining.is_empty() {
            let (finished, _idx, rest) = futures::future::select_all(remaining).await;
            remaining = rest;
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(
                        event = "sync_task_failed",
                        error = %err,
                        "sync task failed; shutting down"
                    );
                    cancel_token.cancel();
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(join_err) => {
                    cancel_token.cancel();
                    if result.is_ok() {
                        result = Err(Error::TaskJoinError(join_err));
                    }
                }
            }
        }

        result
    }

    /// Logs every stuck range so operators can intervene.
    pub async fn report_stuck_gaps(&self) -> Result<usize, Error> {
        let stuck = self.broker.list_stuck_gaps(1000).await?;
        for gap in &stuck {
            warn!(
                event = "gap_range_needs_operator",
                gap_id = gap.gap_id,
                start_height = gap.start_height,
                end_height = gap.end_height,
                attempts = gap.attempts,
                last_error = ?gap.last_error,
                "gap range is stuck and will not be retried automatically"
            );
        }
        Ok(stuck.len())
    }
}

async fn run_gap_maintenance_loop(
    broker: Arc<dyn SequenceBroker>,
    repairer: GapRepairer,
    genesis: i64,
    max_gaps_per_pass: i64,
    scan_interval: Duration,
    cancel_token: CancellationToken,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(scan_interval) => {}
        }

        let report = broker
            .detect_and_enqueue_gaps(genesis, max_gaps_per_pass)
            .await?;
        if !report.detected_ranges.is_empty() {
            info!(
                event = "gap_scan_complete",
                observed_max = ?report.observed_max,
                detected = report.detected_ranges.len(),
                enqueued = report.enqueued,
                already_open = report.already_open,
                "gap detection pass complete"
            );
        }

        repairer.run_pass(cancel_token.clone()).await?;

        if let Some(metrics) = INDEXER_METRICS.get() {
            metrics.frontier_height.set(broker.frontier(genesis).await?);
        }
    }
}
