use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::broker::SequenceBroker;
use super::error::Error;
use super::gap_repair::{GapRepairConfig, GapRepairer};
use super::types::{
    BatchRunSummary, HeightOutcomeKind, IngestWorkerConfig, StorageBackend,
};
use super::worker::{BlockFetcher, BlockPersister, IngestWorker, TipProbe};
use crate::sequence_manager::GapStatus;
use crate::server::monitoring::INDEXER_METRICS;

/// Configuration for one batch ingestion run.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Maximum number of new heights ingested in this run.
    pub batch_size: i64,
    /// Number of height-processing workers.
    pub worker_count: usize,
    /// Lowest height the store is expected to contain.
    pub genesis: i64,
    /// Explicit starting height; defaults to one past the highest recorded height.
    pub start_height: Option<i64>,
    /// Inclusive upper cap on the planned window, below the source tip.
    pub end_height: Option<i64>,
    /// Skips the post-ingest gap detection and repair phase.
    pub skip_gaps: bool,
    /// Cap on ranges enqueued by one detection pass.
    pub max_gaps_per_pass: i64,
    /// Per-height micro-retry behavior.
    pub ingest_worker: IngestWorkerConfig,
    /// Gap-repair phase tuning.
    pub gap_repair: GapRepairConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            worker_count: 4,
            genesis: 0,
            start_height: None,
            end_height: None,
            skip_gaps: false,
            max_gaps_per_pass: 1000,
            ingest_worker: IngestWorkerConfig::default(),
            gap_repair: GapRepairConfig::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerLoopSummary {
    succeeded: usize,
    not_yet_available: usize,
    failed: usize,
}

/// Coordinates one bounded ingestion run: plan the height window, fan heights
/// out across workers, then detect and repair whatever the run left missing.
#[derive(Clone)]
pub struct BatchOrchestrator {
    broker: Arc<dyn SequenceBroker>,
    fetcher: Arc<dyn BlockFetcher>,
    probe: Arc<dyn TipProbe>,
    backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(
        broker: Arc<dyn SequenceBroker>,
        fetcher: Arc<dyn BlockFetcher>,
        probe: Arc<dyn TipProbe>,
        backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
        config: BatchConfig,
    ) -> Self {
        Self {
            broker,
            fetcher,
            probe,
            backends,
            config,
        }
    }

    /// Runs one batch pass.
    ///
    /// Steps:
    /// 1. Return crashed in-flight repair ranges to the pending queue.
    /// 2. Resolve the source tip and plan the height window for this run.
    /// 3. Ingest the window across round-robin partitioned workers.
    /// 4. Detect gaps and run one repair pass (unless disabled).
    ///
    /// Cancelling the token stops workers before their next height and skips
    /// the gap phase; heights already in flight finish, and the summary still
    /// reflects the resulting store state.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<BatchRunSummary, Error> {
        let started_at = Instant::now();

        let requeued = self.broker.requeue_in_flight_gaps().await?;
        if requeued > 0 {
            info!(
                event = "in_flight_gaps_requeued",
                requeued, "returned crashed in-flight gap ranges to pending"
            );
        }

        let latest = self.probe.latest_height().await.map_err(|err| {
            Error::Orchestration(format!("failed to resolve source tip: {}", err.message))
        })?;

        let start = match self.config.start_height {
            Some(start) => start.max(self.config.genesis),
            None => match self.broker.max_recorded_height().await? {
                Some(max) => max + 1,
                None => self.config.genesis,
            },
        };

        let mut end = latest.min(start.saturating_add(self.config.batch_size.max(1) - 1));
        if let Some(cap) = self.config.end_height {
            end = end.min(cap);
        }
        let heights: Vec<i64> = if start > end {
            Vec::new()
        } else {
            (start..=end).collect()
        };

        info!(
            event = "batch_run_planned",
            source_tip = latest,
            start_height = start,
            planned_heights = heights.len(),
            worker_count = self.config.worker_count,
            "planned batch ingestion window"
        );

        let mut summary = BatchRunSummary {
            attempted: heights.len(),
            ..BatchRunSummary::default()
        };

        let fatal_seen = Arc::new(AtomicBool::new(false));
        let mut worker_handles = Vec::new();
        for bucket in partition_round_robin(&heights, self.config.worker_count) {
            let orchestrator = self.clone();
            let worker_fatal = fatal_seen.clone();
            let worker_cancel = cancel_token.clone();
            worker_handles.push(tokio::spawn(async move {
                orchestrator
                    .run_worker_loop(bucket, worker_fatal, worker_cancel)
                    .await
            }));
        }

        for handle in worker_handles {
            let worker_summary = handle.await??;
            summary.succeeded += worker_summary.succeeded;
            summary.not_yet_available += worker_summary.not_yet_available;
            summary.failed += worker_summary.failed;
        }

        if !self.config.skip_gaps && !cancel_token.is_cancelled() {
            let report = self
                .broker
                .detect_and_enqueue_gaps(self.config.genesis, self.config.max_gaps_per_pass)
                .await?;
            summary.gaps_detected = report.detected_ranges.len();
            if let Some(metrics) = INDEXER_METRICS.get() {
                metrics.gaps_enqueued_total.inc_by(report.enqueued as u64);
            }

            let repairer = GapRepairer::new(
                Arc::clone(&self.broker),
                Arc::clone(&self.fetcher),
                self.backends.clone(),
                self.config.gap_repair,
            );
            let repair = repairer.run_pass(cancel_token.clone()).await?;
            summary.gaps_resolved = repair.resolved;
        }

        summary.gaps_stuck = self.broker.count_gaps_by_status(GapStatus::Stuck).await? as usize;
        summary.gaps_still_open = (self.broker.count_gaps_by_status(GapStatus::Pending).await?
            + self.broker.count_gaps_by_status(GapStatus::InFlight).await?)
            as usize;

        // Cleanliness is judged on end state: whatever the window still lacks
        // after the gap phase, minus heights the source has not produced yet.
        if let (Some(&window_start), Some(&window_end)) = (heights.first(), heights.last()) {
            let still_missing = self
                .broker
                .list_missing_heights(window_start, window_end)
                .await?;
            summary.unresolved = still_missing
                .len()
                .saturating_sub(summary.not_yet_available);
        }

        if let Some(metrics) = INDEXER_METRICS.get() {
            metrics.source_tip_height.set(latest);
            metrics.blocks_ingested_total.inc_by(summary.succeeded as u64);
            metrics.heights_failed_total.inc_by(summary.failed as u64);
            metrics.open_gap_ranges.set(summary.gaps_still_open as i64);
            if let Some(max) = self.broker.max_recorded_height().await? {
                metrics.highest_recorded_height.set(max);
            }
            metrics
                .frontier_height
                .set(self.broker.frontier(self.config.genesis).await?);
        }

        let elapsed = started_at.elapsed();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            summary.succeeded as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        info!(
            event = "batch_run_complete",
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            not_yet_available = summary.not_yet_available,
            failed = summary.failed,
            unresolved = summary.unresolved,
            gaps_detected = summary.gaps_detected,
            gaps_resolved = summary.gaps_resolved,
            gaps_stuck = summary.gaps_stuck,
            gaps_still_open = summary.gaps_still_open,
            elapsed_ms = elapsed.as_millis() as u64,
            blocks_per_second = throughput,
            "batch run complete"
        );

        Ok(summary)
    }

    async fn run_worker_loop(
        &self,
        heights: Vec<i64>,
        fatal_seen: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) -> Result<WorkerLoopSummary, Error> {
        let worker = IngestWorker::new(
            Arc::clone(&self.fetcher),
            self.backends.clone(),
            self.config.ingest_worker,
        );

        let mut summary = WorkerLoopSummary::default();
        for height in heights {
            if fatal_seen.load(Ordering::Relaxed) || cancel_token.is_cancelled() {
                break;
            }

            let (outcome, block) = worker.process_height_once(height).await;
            match outcome.kind {
                HeightOutcomeKind::Succeeded => {
                    let block = block.ok_or_else(|| {
                        Error::Orchestration(format!(
                            "successful outcome for height {height} carried no block"
                        ))
                    })?;
                    self.broker
                        .record_height(block.height, block.hash, block.timestamp)
                        .await?;
                    summary.succeeded += 1;
                }
                HeightOutcomeKind::NotYetAvailable => {
                    summary.not_yet_available += 1;
                }
                HeightOutcomeKind::RetryableFailure => {
                    summary.failed += 1;
                    warn!(
                        event = "batch_height_failed",
                        height,
                        attempts = outcome.attempts,
                        message = ?outcome.message,
                        "height failed after retries; left for gap repair"
                    );
                }
                HeightOutcomeKind::FatalFailure => {
                    summary.failed += 1;
                    fatal_seen.store(true, Ordering::Relaxed);
                    warn!(
                        event = "batch_height_fatal",
                        height,
                        message = ?outcome.message,
                        "fatal failure; aborting batch workers"
                    );
                    break;
                }
            }
        }

        Ok(summary)
    }
}

/// Distributes heights across workers round-robin, preserving order per bucket.
fn partition_round_robin(heights: &[i64], worker_count: usize) -> Vec<Vec<i64>> {
    let worker_count = worker_count.max(1);
    let mut buckets: Vec<Vec<i64>> = vec![Vec::new(); worker_count];
    for (idx, &height) in heights.iter().enumerate() {
        buckets[idx % worker_count].push(height);
    }
    buckets.retain(|bucket| !bucket.is_empty());
    buckets
}
