use std::sync::Arc;

use tracing::debug;

use crate::chain_client::BlockRecord;

use super::super::types::{
    HeightOutcome, HeightOutcomeKind, IngestWorkerConfig, StorageBackend,
};
use super::core::{FetchAttemptResult, IngestCore};
use super::fetcher::BlockFetcher;
use super::persister::BlockPersister;

/// Executes single-height ingestion attempts against the configured backends.
///
/// The worker never touches sequence state; it only fetches and persists, and
/// reports what happened. Recording the height durably is the caller's job, so
/// a crash between persist and record re-runs an idempotent persist rather than
/// losing data.
pub struct IngestWorker<F>
where
    F: BlockFetcher,
{
    core: IngestCore<F>,
}

impl<F> IngestWorker<F>
where
    F: BlockFetcher,
{
    pub fn new(
        fetcher: F,
        backends: Vec<(StorageBackend, Arc<dyn BlockPersister>)>,
        config: IngestWorkerConfig,
    ) -> Self {
        Self {
            core: IngestCore::new(fetcher, backends, config),
        }
    }

    /// Processes one height: fetch once (with micro-retries), then persist to
    /// every enabled backend (each with its own micro-retries).
    ///
    /// Returns the fetched block alongside a successful outcome so the caller
    /// can record the height without re-fetching.
    pub async fn process_height_once(&self, height: i64) -> (HeightOutcome, Option<BlockRecord>) {
        match self.core.fetch_with_retry(height).await {
            FetchAttemptResult::Found { block, attempts } => {
                if let Some(failure) = self.core.persist_with_retry(&block).await {
                    return (failure, None);
                }
                debug!(event = "block_ingested", height, attempts);
                (HeightOutcome::succeeded(height, attempts), Some(block))
            }
            FetchAttemptResult::NotYetAvailable { attempts } => (
                HeightOutcome {
                    height,
                    kind: HeightOutcomeKind::NotYetAvailable,
                    attempts,
                    message: None,
                },
                None,
            ),
            FetchAttemptResult::RetryableFailure { attempts, message } => (
                HeightOutcome {
                    height,
                    kind: HeightOutcomeKind::RetryableFailure,
                    attempts,
                    message: Some(message),
                },
                None,
            ),
            FetchAttemptResult::FatalFailure { attempts, message } => (
                HeightOutcome {
                    height,
                    kind: HeightOutcomeKind::FatalFailure,
                    attempts,
                    message: Some(message),
                },
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{
        sample_block, test_worker_config, MockFetcher, MockPersister,
    };
    use super::*;
    use crate::sync_service::types::{
        FetchBlockResponse, FetchError, FetchErrorKind, PersistError,
    };

    fn worker_with(
        fetcher: MockFetcher,
        persisters: Vec<(StorageBackend, Arc<MockPersister>)>,
        max_attempts: u32,
    ) -> IngestWorker<MockFetcher> {
        let backends = persisters
            .into_iter()
            .map(|(backend, persister)| (backend, persister as Arc<dyn BlockPersister>))
            .collect();
        IngestWorker::new(fetcher, backends, test_worker_config(max_attempts))
    }

    #[tokio::test]
    async fn transient_fetch_failures_retry_until_success() {
        let fetcher = MockFetcher::with_plan(vec![(
            7,
            vec![
                Err(FetchError::new(FetchErrorKind::Network, "connection reset")),
                Err(FetchError::new(FetchErrorKind::RateLimited, "429")),
                Ok(FetchBlockResponse::Found(sample_block(7))),
            ],
        )]);
        let persister = Arc::new(MockPersister::default());
        let worker = worker_with(fetcher, vec![(StorageBackend::Database, persister.clone())], 3);

        let (outcome, block) = worker.process_height_once(7).await;

        assert_eq!(outcome.kind, HeightOutcomeKind::Succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(block.map(|b| b.height), Some(7));
        assert_eq!(persister.persisted_heights(), vec![7]);
    }

    #[tokio::test]
    async fn fatal_fetch_failure_does_not_retry() {
        let fetcher = MockFetcher::with_plan(vec![(
            7,
            vec![Err(FetchError::new(
                FetchErrorKind::MalformedResponse,
                "body missing `hash`",
            ))],
        )]);
        let persister = Arc::new(MockPersister::default());
        let worker = worker_with(fetcher, vec![(StorageBackend::Database, persister.clone())], 5);

        let (outcome, block) = worker.process_height_once(7).await;

        assert_eq!(outcome.kind, HeightOutcomeKind::FatalFailure);
        assert_eq!(outcome.attempts, 1);
        assert!(block.is_none());
        assert_eq!(persister.calls(), 0);
    }

    #[tokio::test]
    async fn storage_retry_does_not_refetch() {
        let fetcher = MockFetcher::with_plan(vec![(
            7,
            vec![Ok(FetchBlockResponse::Found(sample_block(7)))],
        )]);
        let flaky = Arc::new(MockPersister::with_outcomes(vec![
            Err(PersistError::retryable("disk briefly unavailable")),
            Ok(()),
        ]));
        let worker = worker_with(fetcher, vec![(StorageBackend::File, flaky.clone())], 3);

        let (outcome, _block) = worker.process_height_once(7).await;

        assert_eq!(outcome.kind, HeightOutcomeKind::Succeeded);
        assert_eq!(flaky.calls(), 2);
        // The scripted fetch plan has exactly one response, so a second fetch
        // would have failed this test with a scripted-exhaustion error.
    }

    #[tokio::test]
    async fn failing_backend_does_not_rewrite_earlier_backend() {
        let fetcher = MockFetcher::with_plan(vec![(
            7,
            vec![Ok(FetchBlockResponse::Found(sample_block(7)))],
        )]);
        let database = Arc::new(MockPersister::default());
        let file = Arc::new(MockPersister::with_outcomes(vec![Err(
            PersistError::fatal("output directory deleted"),
        )]));
        let worker = worker_with(
            fetcher,
            vec![
                (StorageBackend::Database, database.clone()),
                (StorageBackend::File, file.clone()),
            ],
            3,
        );

        let (outcome, block) = worker.process_height_once(7).await;

        assert_eq!(outcome.kind, HeightOutcomeKind::FatalFailure);
        assert!(outcome
            .message
            .as_deref()
            .is_some_and(|msg| msg.starts_with("file backend:")));
        assert!(block.is_none());
        assert_eq!(database.calls(), 1);
        assert_eq!(file.calls(), 1);
    }

    #[tokio::test]
    async fn tip_miss_is_not_a_failure() {
        let fetcher =
            MockFetcher::with_plan(vec![(9, vec![Ok(FetchBlockResponse::NotYetAvailable)])]);
        let persister = Arc::new(MockPersister::default());
        let worker = worker_with(fetcher, vec![(StorageBackend::Database, persister.clone())], 3);

        let (outcome, block) = worker.process_height_once(9).await;

        assert_eq!(outcome.kind, HeightOutcomeKind::NotYetAvailable);
        assert!(block.is_none());
        assert_eq!(persister.calls(), 0);
    }
}
