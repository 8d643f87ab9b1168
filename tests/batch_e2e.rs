#![cfg(feature = "sqlite-tests")]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use block_indexer_lib::chain_client::{BlockRecord, BlockTransaction};
use block_indexer_lib::db::sqlite_test::setup_in_memory_sqlite;
use block_indexer_lib::sync_service::types::{
    FetchBlockResponse, FetchError, FetchErrorKind, GapRepairPolicy, IngestWorkerConfig,
    PersistError, RetryPolicy, StorageBackend,
};
use block_indexer_lib::sync_service::worker::{BlockFetcher, BlockPersister, TipProbe};
use block_indexer_lib::sync_service::{
    BatchConfig, BatchOrchestrator, GapRepairConfig, SequenceBroker, SqliteSequenceBroker,
};

fn sample_block(height: i64) -> BlockRecord {
    BlockRecord {
        height,
        hash: format!("0x{height:08x}"),
        timestamp: 1_700_000_000 + height,
        transactions: vec![BlockTransaction {
            tx_hash: format!("0xtx{height:08x}"),
            payload: serde_json::json!({ "height": height }),
        }],
    }
}

fn fast_worker_config() -> IngestWorkerConfig {
    IngestWorkerConfig {
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        },
    }
}

/// Serves synthetic blocks up to a fixed tip, with per-height scripted failures.
struct ScriptedFetcher {
    latest: i64,
    scripted: Mutex<HashMap<i64, VecDeque<FetchError>>>,
    always_fail: HashMap<i64, FetchError>,
}

impl ScriptedFetcher {
    fn new(latest: i64) -> Self {
        Self {
            latest,
            scripted: Mutex::new(HashMap::new()),
            always_fail: HashMap::new(),
        }
    }

    fn fail_n_times(self, height: i64, n: usize, kind: FetchErrorKind) -> Self {
        let mut scripted = self.scripted.lock().expect("scripted plan mutex poisoned");
        scripted.insert(
            height,
            (0..n)
                .map(|attempt| FetchError::new(kind, format!("scripted failure {attempt}")))
                .collect(),
        );
        drop(scripted);
        self
    }

    fn always_fail(mut self, height: i64, kind: FetchErrorKind) -> Self {
        self.always_fail
            .insert(height, FetchError::new(kind, "scripted permanent failure"));
        self
    }
}

impl BlockFetcher for ScriptedFetcher {
    fn fetch_block<'a>(
        &'a self,
        height: i64,
    ) -> BoxFuture<'a, Result<FetchBlockResponse, FetchError>> {
        Box::pin(async move {
            if let Some(err) = self.always_fail.get(&height) {
                return Err(err.clone());
            }
            if let Some(queue) = self
                .scripted
                .lock()
                .expect("scripted plan mutex poisoned")
                .get_mut(&height)
            {
                if let Some(err) = queue.pop_front() {
                    return Err(err);
                }
            }
            if height > self.latest {
                return Ok(FetchBlockResponse::NotYetAvailable);
            }
            Ok(FetchBlockResponse::Found(sample_block(height)))
        })
    }
}

impl TipProbe for ScriptedFetcher {
    fn latest_height(&self) -> BoxFuture<'_, Result<i64, FetchError>> {
        Box::pin(async move { Ok(self.latest) })
    }
}

#[derive(Default)]
struct MemoryPersister {
    heights: Mutex<Vec<i64>>,
}

impl MemoryPersister {
    fn persisted_heights(&self) -> Vec<i64> {
        let mut heights = self
            .heights
            .lock()
            .expect("persisted heights mutex poisoned")
            .clone();
        heights.sort_unstable();
        heights
    }
}

impl BlockPersister for MemoryPersister {
    fn persist_block<'a>(
        &'a self,
        block: &'a BlockRecord,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            self.heights
                .lock()
                .expect("persisted heights mutex poisoned")
                .push(block.height);
            Ok(())
        })
    }
}

fn orchestrator_with(
    broker: Arc<SqliteSequenceBroker>,
    fetcher: Arc<ScriptedFetcher>,
    worker_count: usize,
) -> (BatchOrchestrator, Arc<MemoryPersister>) {
    let persister = Arc::new(MemoryPersister::default());
    let orchestrator = BatchOrchestrator::new(
        broker.clone(),
        fetcher.clone(),
        fetcher,
        vec![(
            StorageBackend::Database,
            persister.clone() as Arc<dyn BlockPersister>,
        )],
        BatchConfig {
            worker_count,
            ingest_worker: fast_worker_config(),
            gap_repair: GapRepairConfig {
                policy: GapRepairPolicy {
                    base_retry_delay: Duration::ZERO,
                    ..GapRepairPolicy::default()
                },
                ingest_worker: fast_worker_config(),
                ..GapRepairConfig::default()
            },
            ..BatchConfig::default()
        },
    );
    (orchestrator, persister)
}

#[tokio::test]
async fn batch_run_ingests_full_window_cleanly() {
    let broker = Arc::new(SqliteSequenceBroker::new(setup_in_memory_sqlite()));
    let fetcher = Arc::new(ScriptedFetcher::new(25));
    let (orchestrator, persister) = orchestrator_with(broker.clone(), fetcher, 4);

    let summary = orchestrator.run(CancellationToken::new()).await.expect("batch run failed");

    assert_eq!(summary.attempted, 26);
    assert_eq!(summary.succeeded, 26);
    assert_eq!(summary.failed, 0);
    assert!(summary.is_clean(), "expected a clean run: {summary:?}");

    let max = broker
        .max_recorded_height()
        .await
        .expect("max_recorded_height failed");
    assert_eq!(max, Some(25));
    assert_eq!(persister.persisted_heights(), (0..=25).collect::<Vec<_>>());
}

#[tokio::test]
async fn batch_run_repairs_exhausted_heights_via_gap_queue() {
    let broker = Arc::new(SqliteSequenceBroker::new(setup_in_memory_sqlite()));
    let fetcher =
        Arc::new(ScriptedFetcher::new(9).fail_n_times(7, 3, FetchErrorKind::Network));
    let (orchestrator, _persister) = orchestrator_with(broker.clone(), fetcher, 4);

    let summary = orchestrator.run(CancellationToken::new()).await.expect("batch run failed");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.gaps_detected, 1);
    assert_eq!(summary.gaps_resolved, 1);
    assert_eq!(summary.gaps_stuck, 0);
    assert_eq!(summary.gaps_still_open, 0);

    // The gap pass filled everything the ingestion phase dropped, so the run
    // ends clean and the process would exit zero.
    assert_eq!(summary.unresolved, 0);
    assert!(summary.is_clean(), "expected a clean run: {summary:?}");

    let missing = broker
        .list_missing_heights(0, 9)
        .await
        .expect("list_missing_heights failed");
    assert!(missing.is_empty(), "expected no missing heights: {missing:?}");

    let max = broker
        .max_recorded_height()
        .await
        .expect("max_recorded_height failed");
    assert_eq!(max, Some(9));
}

#[tokio::test]
async fn batch_run_parks_permanently_failing_ranges_as_stuck() {
    // An earlier ingester already recorded 5..=9, leaving 0..=4 as a gap. The
    // repair phase trips a permanent auth failure at height 4 and parks the range.
    let mut conn = setup_in_memory_sqlite();
    for height in 5..=9 {
        block_indexer_lib::sequence_manager::record_height(
            &mut conn,
            height,
            &format!("0x{height:08x}"),
            1_700_000_000 + height,
        )
        .expect("failed to seed recorded height");
    }
    let broker = Arc::new(SqliteSequenceBroker::new(conn));
    let fetcher =
        Arc::new(ScriptedFetcher::new(9).always_fail(4, FetchErrorKind::Unauthorized));
    let (orchestrator, _persister) = orchestrator_with(broker.clone(), fetcher, 2);

    let summary = orchestrator.run(CancellationToken::new()).await.expect("batch run failed");

    assert!(!summary.is_clean(), "expected an unclean run: {summary:?}");
    assert_eq!(summary.gaps_detected, 1);
    assert_eq!(summary.gaps_resolved, 0);
    assert_eq!(summary.gaps_stuck, 1);
    assert_eq!(summary.gaps_still_open, 0);

    let stuck = broker.list_stuck_gaps(10).await.expect("list_stuck_gaps failed");
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].start_height, 0);
    assert_eq!(stuck[0].end_height, 4);

    // Every height the repair pass could fill before the failure is recorded.
    let missing = broker
        .list_missing_heights(0, 9)
        .await
        .expect("list_missing_heights failed");
    assert_eq!(missing, vec![4]);
}

#[tokio::test]
async fn batch_run_resumes_from_recorded_frontier() {
    let broker = Arc::new(SqliteSequenceBroker::new(setup_in_memory_sqlite()));
    let fetcher = Arc::new(ScriptedFetcher::new(20));
    let (orchestrator, persister) = orchestrator_with(broker, fetcher, 4);

    let first = orchestrator.run(CancellationToken::new()).await.expect("first batch run failed");
    assert!(first.is_clean());

    // A second run against the same tip finds nothing new to do.
    let second = orchestrator.run(CancellationToken::new()).await.expect("second batch run failed");
    assert_eq!(second.attempted, 0);
    assert_eq!(second.succeeded, 0);
    assert!(second.is_clean());

    assert_eq!(persister.persisted_heights(), (0..=20).collect::<Vec<_>>());
}
