use std::sync::Arc;

use crate::chain_client::BlockRecord;

use super::super::types::{
    FetchBlockResponse, HeightOutcome, HeightOutcomeKind, IngestWorkerConfig, StorageBackend,
};
use super::fetcher::BlockFetcher;
use super::persister::BlockPersister;
use super::retry::run_with_retry;

pub(crate) enum FetchAttemptResult {
    Found { block: BlockRecord, attempts: u32 },
    NotYetAvailable { attempts: u32 },
    RetryableFailure { attempts: u32, message: String },
    FatalFailure { attempts: u32, message: String },
}

/// Shared per-height ingestion logic used by the batch, collector, and gap-repair paths.
///
/// This owns fetch retry/classification plus per-backend persistence retry. A block is
/// fetched exactly once per height; storage retries replay the already-fetched record
/// against only the backends that have not yet succeeded.
pub(crate) struct IngestCore<F>
where
    F: BlockFetcher,
{
    fetcher: F,
    backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
    config: IngestWorkerConfig,
}

impl<F> IngestCore<F>
where
    F: BlockFetcher,
{
    pub(crate) fn new(
        fetcher: F,
        backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
        config: IngestWorkerConfig,
    ) -> Self {
        Self {
            fetcher,
            backends,
            config,
        }
    }

    pub(crate) async fn fetch_with_retry(&self, height: i64) -> FetchAttemptResult {
        match run_with_retry(
            &self.config.retry_policy,
            height,
            |_| self.fetcher.fetch_block(height),
            |err| err.is_retryable(),
        )
        .await
        {
            Ok((FetchBlockResponse::Found(block), attempts)) => {
                FetchAttemptResult::Found { block, attempts }
            }
            Ok((FetchBlockResponse::NotYetAvailable, attempts)) => {
                FetchAttemptResult::NotYetAvailable { attempts }
            }
            Err(terminal) if terminal.exhausted_retryable => FetchAttemptResult::RetryableFailure {
                attempts: terminal.attempts,
                message: terminal.error.message,
            },
            Err(terminal) => FetchAttemptResult::FatalFailure {
                attempts: terminal.attempts,
                message: terminal.error.message,
            },
        }
    }

    /// Persists one fetched block into every enabled backend.
    ///
    /// Each backend retries independently under the shared policy, so a flaky file
    /// write never causes a redundant database write or a re-fetch. Returns the
    /// failure outcome of the first backend that terminally fails.
    pub(crate) async fn persist_with_retry(&self, block: &BlockRecord) -> Option<HeightOutcome> {
        for (backend, persister) in &self.backends {
            let result = run_with_retry(
                &self.config.retry_policy,
                block.height,
                |_| persister.persist_block(block),
                |err| err.is_retryable(),
            )
            .await;

            if let Err(terminal) = result {
                let kind = if terminal.exhausted_retryable {
                    HeightOutcomeKind::RetryableFailure
                } else {
                    HeightOutcomeKind::FatalFailure
                };
                return Some(HeightOutcome {
                    height: block.height,
                    kind,
                    attempts: terminal.attempts,
                    message: Some(format!(
                        "{} backend: {}",
                        backend.as_str(),
                        terminal.error.message
                    )),
                });
            }
        }

        None
    }
}
