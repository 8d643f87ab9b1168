use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flume::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::broker::SequenceBroker;
use super::error::Error;
use super::types::{
    GapRepairPolicy, HeightOutcomeKind, IngestWorkerConfig, StorageBackend,
};
use super::worker::{BlockFetcher, BlockPersister, IngestWorker};
use crate::sequence_manager::GapRange;
use crate::server::monitoring::INDEXER_METRICS;

/// Configuration for one gap-repair pass.
#[derive(Debug, Clone, Copy)]
pub struct GapRepairConfig {
    /// Number of range-repair workers.
    pub worker_count: usize,
    /// Capacity of the in-memory claim queue.
    pub queue_capacity: usize,
    /// Macro retry budget for whole ranges.
    pub policy: GapRepairPolicy,
    /// Per-height micro-retry behavior.
    pub ingest_worker: IngestWorkerConfig,
}

impl Default for GapRepairConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 64,
            policy: GapRepairPolicy::default(),
            ingest_worker: IngestWorkerConfig::default(),
        }
    }
}

/// Outcome summary of one gap-repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapRepairSummary {
    pub claimed: usize,
    pub resolved: usize,
    pub requeued: usize,
    pub stuck: usize,
    pub heights_filled: usize,
}

enum RangeDisposition {
    Resolved,
    Requeue { message: String },
    Stuck { message: String },
}

struct RangeRepairReport {
    disposition: RangeDisposition,
    heights_filled: usize,
}

/// Claims open gap ranges and drives per-height repair workers over them.
#[derive(Clone)]
pub struct GapRepairer {
    broker: Arc<dyn SequenceBroker>,
    fetcher: Arc<dyn BlockFetcher>,
    backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
    config: GapRepairConfig,
}

impl GapRepairer {
    pub fn new(
        broker: Arc<dyn SequenceBroker>,
        fetcher: Arc<dyn BlockFetcher>,
        backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
        config: GapRepairConfig,
    ) -> Self {
        Self {
            broker,
            fetcher,
            backends,
            config,
        }
    }

    /// Runs one repair pass: claim every currently-eligible pending range and
    /// repair each one, resolving, requeueing, or parking it as stuck.
    ///
    /// Cancelling the token stops new claims; ranges already claimed are
    /// still driven to a disposition before the pass returns.
    pub async fn run_pass(
        &self,
        cancel_token: CancellationToken,
    ) -> Result<GapRepairSummary, Error> {
        let (sender, receiver) =
            flume::bounded::<GapRange>(self.config.queue_capacity.max(1));

        let heights_filled = Arc::new(AtomicUsize::new(0));
        let mut worker_handles = Vec::new();
        for _worker_idx in 0..self.config.worker_count.max(1) {
            let repairer = self.clone();
            let worker_receiver = receiver.clone();
            let worker_filled = heights_filled.clone();
            worker_handles.push(tokio::spawn(async move {
                repairer.run_worker_loop(worker_receiver, worker_filled).await
            }));
        }
        drop(receiver);

        let claimed = self.claim_eligible_gaps(sender, cancel_token).await?;

        let mut summary = GapRepairSummary {
            claimed,
            ..GapRepairSummary::default()
        };
        for handle in worker_handles {
            let (resolved, requeued, stuck) = handle.await??;
            summary.resolved += resolved;
            summary.requeued += requeued;
            summary.stuck += stuck;
        }
        summary.heights_filled = heights_filled.load(Ordering::Relaxed);

        if let Some(metrics) = INDEXER_METRICS.get() {
            metrics.gaps_resolved_total.inc_by(summary.resolved as u64);
            metrics.gaps_stuck_total.inc_by(summary.stuck as u64);
            metrics
                .blocks_ingested_total
                .inc_by(summary.heights_filled as u64);
        }

        info!(
            event = "gap_repair_pass_complete",
            claimed = summary.claimed,
            resolved = summary.resolved,
            requeued = summary.requeued,
            stuck = summary.stuck,
            heights_filled = summary.heights_filled,
            "gap repair pass complete"
        );

        Ok(summary)
    }

    async fn claim_eligible_gaps(
        &self,
        sender: Sender<GapRange>,
        cancel_token: CancellationToken,
    ) -> Result<usize, Error> {
        let mut claimed = 0usize;

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            let maybe_gap = self.broker.claim_next_pending_gap(now_epoch()).await?;
            let Some(gap) = maybe_gap else {
                break;
            };

            claimed += 1;
            if sender.send_async(gap).await.is_err() {
                return Err(Error::Orchestration(
                    "gap queue closed before all claims were dispatched".to_string(),
                ));
            }
        }

        Ok(claimed)
    }

    async fn run_worker_loop(
        &self,
        receiver: Receiver<GapRange>,
        heights_filled: Arc<AtomicUsize>,
    ) -> Result<(usize, usize, usize), Error> {
        let worker = IngestWorker::new(
            Arc::clone(&self.fetcher),
            self.backends.clone(),
            self.config.ingest_worker,
        );

        let mut resolved = 0usize;
        let mut requeued = 0usize;
        let mut stuck = 0usize;

        while let Ok(gap) = receiver.recv_async().await {
            let report = self.repair_range(&worker, &gap).await?;
            heights_filled.fetch_add(report.heights_filled, Ordering::Relaxed);

            match report.disposition {
                RangeDisposition::Resolved => {
                    self.broker.resolve_gap(gap.gap_id).await?;
                    resolved += 1;
                }
                RangeDisposition::Requeue { message } => {
                    if gap.attempts >= self.config.policy.max_range_attempts {
                        warn!(
                            event = "gap_range_stuck",
                            gap_id = gap.gap_id,
                            start_height = gap.start_height,
                            end_height = gap.end_height,
                            attempts = gap.attempts,
                            message = %message,
                            "gap range exhausted its repair budget"
                        );
                        self.broker.mark_gap_stuck(gap.gap_id, message).await?;
                        stuck += 1;
                    } else {
                        let delay = self.config.policy.retry_delay(gap.attempts);
                        let next_retry_at = now_epoch() + delay.as_secs() as i64;
                        self.broker
                            .requeue_gap(gap.gap_id, Some(next_retry_at), message)
                            .await?;
                        requeued += 1;
                    }
                }
                RangeDisposition::Stuck { message } => {
                    warn!(
                        event = "gap_range_stuck",
                        gap_id = gap.gap_id,
                        start_height = gap.start_height,
                        end_height = gap.end_height,
                        message = %message,
                        "gap range hit a fatal failure"
                    );
                    self.broker.mark_gap_stuck(gap.gap_id, message).await?;
                    stuck += 1;
                }
            }
        }

        Ok((resolved, requeued, stuck))
    }

    /// Repairs one claimed range height by height.
    ///
    /// Heights already recorded (filled by a concurrent ingester) are skipped
    /// up front, so repair never re-fetches work that is already durable.
    async fn repair_range(
        &self,
        worker: &IngestWorker<Arc<dyn BlockFetcher>>,
        gap: &GapRange,
    ) -> Result<RangeRepairReport, Error> {
        let missing = self
            .broker
            .list_missing_heights(gap.start_height, gap.end_height)
            .await?;

        let mut heights_filled = 0usize;
        for height in missing {
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
                    heights_filled += 1;
                }
                HeightOutcomeKind::NotYetAvailable => {
                    return Ok(RangeRepairReport {
                        disposition: RangeDisposition::Requeue {
                            message: format!("height {height} not yet available at source"),
                        },
                        heights_filled,
                    });
                }
                HeightOutcomeKind::RetryableFailure => {
                    return Ok(RangeRepairReport {
                        disposition: RangeDisposition::Requeue {
                            message: outcome.message.unwrap_or_else(|| {
                                format!("retryable failure at height {height}")
                            }),
                        },
                        heights_filled,
                    });
                }
                HeightOutcomeKind::FatalFailure => {
                    return Ok(RangeRepairReport {
                        disposition: RangeDisposition::Stuck {
                            message: outcome.message.unwrap_or_else(|| {
                                format!("fatal failure at height {height}")
                            }),
                        },
                        heights_filled,
                    });
                }
            }
        }

        Ok(RangeRepairReport {
            disposition: RangeDisposition::Resolved,
            heights_filled,
        })
    }
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
