use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::chain_client::{BlockRecord, BlockTransaction};

use super::super::types::{
    FetchBlockResponse, FetchError, FetchErrorKind, IngestWorkerConfig, PersistError, RetryPolicy,
};
use super::{BlockFetcher, BlockPersister, TipProbe};

pub(crate) fn test_worker_config(max_attempts: u32) -> IngestWorkerConfig {
    IngestWorkerConfig {
        retry_policy: RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        },
    }
}

pub(crate) fn sample_block(height: i64) -> BlockRecord {
    BlockRecord {
        height,
        hash: format!("0x{height:08x}"),
        timestamp: 1_700_000_000 + height,
        transactions: vec![BlockTransaction {
            tx_hash: format!("0x{height:08x}01"),
            payload: serde_json::json!({"amount": height}),
        }],
    }
}

#[derive(Default)]
pub(crate) struct MockFetcher {
    plans: Mutex<HashMap<i64, VecDeque<Result<FetchBlockResponse, FetchError>>>>,
    call_counts: Mutex<HashMap<i64, u32>>,
    latest: Mutex<i64>,
}

impl MockFetcher {
    pub(crate) fn with_plan(
        plan: Vec<(i64, Vec<Result<FetchBlockResponse, FetchError>>)>,
    ) -> Self {
        let mut plans = HashMap::new();
        for (height, entries) in plan {
            plans.insert(height, entries.into_iter().collect());
        }
        Self {
            plans: Mutex::new(plans),
            call_counts: Mutex::new(HashMap::new()),
            latest: Mutex::new(0),
        }
    }

    /// Fetcher that always finds a synthetic block for any height.
    pub(crate) fn always_found() -> Self {
        Self::default()
    }

    pub(crate) fn set_latest(&self, height: i64) {
        *self.latest.lock().expect("latest mutex poisoned") = height;
    }

    pub(crate) fn calls_for(&self, height: i64) -> u32 {
        *self
            .call_counts
            .lock()
            .expect("call_count mutex poisoned")
            .get(&height)
            .unwrap_or(&0)
    }
}

impl BlockFetcher for MockFetcher {
    fn fetch_block<'a>(
        &'a self,
        height: i64,
    ) -> BoxFuture<'a, Result<FetchBlockResponse, FetchError>> {
        Box::pin(async move {
            {
                let mut counts = self.call_counts.lock().expect("call_count mutex poisoned");
                *counts.entry(height).or_insert(0) += 1;
            }

            let mut plans = self.plans.lock().expect("plans mutex poisoned");
            let Some(responses) = plans.get_mut(&height) else {
                return Ok(FetchBlockResponse::Found(sample_block(height)));
            };

            responses.pop_front().ok_or_else(|| {
                FetchError::new(
                    FetchErrorKind::Other,
                    format!("scripted responses exhausted for height {height}"),
                )
            })?
        })
    }
}

impl TipProbe for MockFetcher {
    fn latest_height(&self) -> BoxFuture<'_, Result<i64, FetchError>> {
        Box::pin(async move { Ok(*self.latest.lock().expect("latest mutex poisoned")) })
    }
}

#[derive(Default)]
pub(crate) struct MockPersister {
    outcomes: Mutex<VecDeque<Result<(), PersistError>>>,
    calls: Mutex<u32>,
    persisted_heights: Mutex<Vec<i64>>,
}

impl MockPersister {
    pub(crate) fn with_outcomes(outcomes: Vec<Result<(), PersistError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(0),
            persisted_heights: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        *self.calls.lock().expect("calls mutex poisoned")
    }

    pub(crate) fn persisted_heights(&self) -> Vec<i64> {
        self.persisted_heights
            .lock()
            .expect("persisted_heights mutex poisoned")
            .clone()
    }
}

impl BlockPersister for MockPersister {
    fn persist_block<'a>(
        &'a self,
        block: &'a BlockRecord,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            *self.calls.lock().expect("calls mutex poisoned") += 1;

            let next = self
                .outcomes
                .lock()
                .expect("outcomes mutex poisoned")
                .pop_front()
                .unwrap_or(Ok(()));

            if next.is_ok() {
                self.persisted_heights
                    .lock()
                    .expect("persisted_heights mutex poisoned")
                    .push(block.height);
            }

            next
        })
    }
}
