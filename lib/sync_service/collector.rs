use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::SequenceBroker;
use super::error::Error;
use super::types::{HeightOutcomeKind, IngestWorkerConfig, StorageBackend};
use super::worker::{BlockFetcher, BlockPersister, IngestWorker, TipProbe};
use crate::server::monitoring::INDEXER_METRICS;

/// Configuration for the continuous tip-following collector.
#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    /// Lowest height the store is expected to contain.
    pub genesis: i64,
    /// Delay between successive block requests while catching up to the tip.
    pub block_fetch_delay: Duration,
    /// Delay before re-polling the source tip once caught up.
    pub poll_interval: Duration,
    /// Consecutive already-recorded heights tolerated before the collector
    /// re-reads its cursor from storage (another ingester is ahead of us).
    pub duplicate_cutoff: u32,
    /// Per-height micro-retry behavior.
    pub ingest_worker: IngestWorkerConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            genesis: 0,
            block_fetch_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(500),
            duplicate_cutoff: 10,
            ingest_worker: IngestWorkerConfig::default(),
        }
    }
}

/// Follows the source tip, ingesting each new height exactly once.
///
/// The collector only moves forward; everything behind the highest recorded
/// height is the gap detector's responsibility.
pub struct Collector {
    broker: Arc<dyn SequenceBroker>,
    fetcher: Arc<dyn BlockFetcher>,
    probe: Arc<dyn TipProbe>,
    backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(
        broker: Arc<dyn SequenceBroker>,
        fetcher: Arc<dyn BlockFetcher>,
        probe: Arc<dyn TipProbe>,
        backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            broker,
            fetcher,
            probe,
            backends,
            config,
        }
    }

    /// Runs the collector loop until cancelled.
    ///
    /// Returns an error only on fatal conditions (auth rejection, malformed
    /// payloads, broker loss); transient upstream trouble is logged and the
    /// loop re-polls.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), Error> {
        let worker = IngestWorker::new(
            Arc::clone(&self.fetcher),
            self.backends.clone(),
            self.config.ingest_worker,
        );

        let mut cursor = match self.broker.max_recorded_height().await? {
            Some(max) => max,
            None => self.config.genesis - 1,
        };
        info!(
            event = "collector_started",
            cursor, "collector following source tip"
        );

        loop {
            if cancel_token.is_cancelled() {
                return Ok(());
            }

            let latest = match self.probe.latest_height().await {
                Ok(latest) => latest,
                Err(err) if err.is_retryable() => {
                    warn!(
                        event = "collector_tip_probe_failed",
                        message = %err.message,
                        "failed to resolve source tip; re-polling"
                    );
                    self.sleep_or_cancel(self.config.poll_interval, &cancel_token)
                        .await;
                    continue;
                }
                Err(err) => {
                    return Err(Error::Orchestration(format!(
                        "fatal tip probe failure: {}",
                        err.message
                    )));
                }
            };

            if let Some(metrics) = INDEXER_METRICS.get() {
                metrics.source_tip_height.set(latest);
            }

            let mut consecutive_duplicates = 0u32;
            while cursor < latest {
                if cancel_token.is_cancelled() {
                    return Ok(());
                }

                let height = cursor + 1;
                let (outcome, block) = worker.process_height_once(height).await;
                match outcome.kind {
                    HeightOutcomeKind::Succeeded => {
                        let block = block.ok_or_else(|| {
                            Error::Orchestration(format!(
                                "successful outcome for height {height} carried no block"
                            ))
                        })?;
                        let inserted = self
                            .broker
                            .record_height(block.height, block.hash, block.timestamp)
                            .await?;
                        cursor = height;

                        if let Some(metrics) = INDEXER_METRICS.get() {
                            metrics.highest_recorded_height.set(cursor);
                            if inserted {
                                metrics.blocks_ingested_total.inc();
                            }
                        }

                        if inserted {
                            consecutive_duplicates = 0;
                        } else {
                            consecutive_duplicates += 1;
                            if consecutive_duplicates >= self.config.duplicate_cutoff.max(1) {
                                // Another ingester is ahead; jump to its frontier.
                                cursor = self
                                    .broker
                                    .max_recorded_height()
                                    .await?
                                    .unwrap_or(cursor);
                                debug!(
                                    event = "collector_cursor_jumped",
                                    cursor, "skipped ahead past already-recorded heights"
                                );
                                consecutive_duplicates = 0;
                            }
                        }
                    }
                    HeightOutcomeKind::NotYetAvailable => {
                        // Tip raced backwards or the probe over-reported; re-poll.
                        break;
                    }
                    HeightOutcomeKind::RetryableFailure => {
                        warn!(
                            event = "collector_height_failed",
                            height,
                            attempts = outcome.attempts,
                            message = ?outcome.message,
                            "height failed after retries; re-polling before retrying"
                        );
                        break;
                    }
                    HeightOutcomeKind::FatalFailure => {
                        return Err(Error::Orchestration(format!(
                            "fatal failure at height {height}: {}",
                            outcome.message.unwrap_or_default()
                        )));
                    }
                }

                if !self.config.block_fetch_delay.is_zero() {
                    self.sleep_or_cancel(self.config.block_fetch_delay, &cancel_token)
                        .await;
                }
            }

            self.sleep_or_cancel(self.config.poll_interval, &cancel_token)
                .await;
        }
    }

    async fn sleep_or_cancel(&self, duration: Duration, cancel_token: &CancellationToken) {
        tokio::select! {
            _ = cancel_token.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
