use diesel::pg::PgConnection;
use diesel::Connection;
use futures::future::BoxFuture;

use crate::sequence_manager::{self, GapDetectionReport, GapRange, GapStatus};

use super::error::Error;

/// Async facade over the durable sequence state.
///
/// Production uses short-lived blocking Postgres connections per operation, which keeps
/// the control plane off the async data-plane pool. Tests swap in a SQLite-backed broker
/// so orchestration logic runs against the real SQL without a Postgres instance.
pub trait SequenceBroker: Send + Sync {
    fn record_height(
        &self,
        height: i64,
        block_hash: String,
        timestamp: i64,
    ) -> BoxFuture<'_, Result<bool, Error>>;

    fn max_recorded_height(&self) -> BoxFuture<'_, Result<Option<i64>, Error>>;

    /// Largest height `h` such that every height in `[genesis, h]` is recorded;
    /// `genesis - 1` when genesis itself is missing.
    fn frontier(&self, genesis: i64) -> BoxFuture<'_, Result<i64, Error>>;

    fn detect_and_enqueue_gaps(
        &self,
        genesis: i64,
        max_new: i64,
    ) -> BoxFuture<'_, Result<GapDetectionReport, Error>>;

    fn claim_next_pending_gap(
        &self,
        now_epoch: i64,
    ) -> BoxFuture<'_, Result<Option<GapRange>, Error>>;

    fn requeue_gap(
        &self,
        gap_id: i64,
        next_retry_at: Option<i64>,
        last_error: String,
    ) -> BoxFuture<'_, Result<(), Error>>;

    fn resolve_gap(&self, gap_id: i64) -> BoxFuture<'_, Result<(), Error>>;

    fn mark_gap_stuck(
        &self,
        gap_id: i64,
        last_error: String,
    ) -> BoxFuture<'_, Result<(), Error>>;

    fn requeue_in_flight_gaps(&self) -> BoxFuture<'_, Result<usize, Error>>;

    fn list_missing_heights(
        &self,
        start_height: i64,
        end_height: i64,
    ) -> BoxFuture<'_, Result<Vec<i64>, Error>>;

    fn list_stuck_gaps(&self, limit: i64) -> BoxFuture<'_, Result<Vec<GapRange>, Error>>;

    fn count_gaps_by_status(&self, status: GapStatus) -> BoxFuture<'_, Result<i64, Error>>;
}

/// Postgres-backed broker used by production runtime.
pub struct PgSequenceBroker {
    db_url: String,
}

impl PgSequenceBroker {
    pub fn new(db_url: String) -> Self {
        Self { db_url }
    }

    async fn run_op<T, F>(&self, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, Error> + Send + 'static,
    {
        let db_url = self.db_url.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&db_url).map_err(|err| {
                Error::ConnectError(format!("failed to connect to postgres: {err}"))
            })?;
            op(&mut conn)
        })
        .await?
    }
}

impl SequenceBroker for PgSequenceBroker {
    fn record_height(
        &self,
        height: i64,
        block_hash: String,
        timestamp: i64,
    ) -> BoxFuture<'_, Result<bool, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::record_height(conn, height, &block_hash, timestamp)
                .map_err(Error::from)
        }))
    }

    fn max_recorded_height(&self) -> BoxFuture<'_, Result<Option<i64>, Error>> {
        Box::pin(
            self.run_op(|conn| sequence_manager::max_recorded_height(conn).map_err(Error::from)),
        )
    }

    fn frontier(&self, genesis: i64) -> BoxFuture<'_, Result<i64, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::compute_frontier(conn, genesis).map_err(Error::from)
        }))
    }

    fn detect_and_enqueue_gaps(
        &self,
        genesis: i64,
        max_new: i64,
    ) -> BoxFuture<'_, Result<GapDetectionReport, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::detect_and_enqueue_gaps(conn, genesis, max_new).map_err(Error::from)
        }))
    }

    fn claim_next_pending_gap(
        &self,
        now_epoch: i64,
    ) -> BoxFuture<'_, Result<Option<GapRange>, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::claim_next_pending_gap(conn, now_epoch).map_err(Error::from)
        }))
    }

    fn requeue_gap(
        &self,
        gap_id: i64,
        next_retry_at: Option<i64>,
        last_error: String,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::requeue_gap(conn, gap_id, next_retry_at, &last_error)
                .map(|_| ())
                .map_err(Error::from)
        }))
    }

    fn resolve_gap(&self, gap_id: i64) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::resolve_gap(conn, gap_id)
                .map(|_| ())
                .map_err(Error::from)
        }))
    }

    fn mark_gap_stuck(
        &self,
        gap_id: i64,
        last_error: String,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::mark_gap_stuck(conn, gap_id, &last_error)
                .map(|_| ())
                .map_err(Error::from)
        }))
    }

    fn requeue_in_flight_gaps(&self) -> BoxFuture<'_, Result<usize, Error>> {
        Box::pin(
            self.run_op(|conn| sequence_manager::requeue_in_flight_gaps(conn).map_err(Error::from)),
        )
    }

    fn list_missing_heights(
        &self,
        start_height: i64,
        end_height: i64,
    ) -> BoxFuture<'_, Result<Vec<i64>, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::list_missing_heights_in_range(conn, start_height, end_height)
                .map_err(Error::from)
        }))
    }

    fn list_stuck_gaps(&self, limit: i64) -> BoxFuture<'_, Result<Vec<GapRange>, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::list_stuck_gaps(conn, limit).map_err(Error::from)
        }))
    }

    fn count_gaps_by_status(&self, status: GapStatus) -> BoxFuture<'_, Result<i64, Error>> {
        Box::pin(self.run_op(move |conn| {
            sequence_manager::count_gaps_by_status(conn, status).map_err(Error::from)
        }))
    }
}

/// SQLite-backed broker for in-process orchestration tests.
#[cfg(any(test, feature = "sqlite-tests"))]
pub struct SqliteSequenceBroker {
    conn: std::sync::Arc<std::sync::Mutex<diesel::sqlite::SqliteConnection>>,
}

#[cfg(any(test, feature = "sqlite-tests"))]
impl SqliteSequenceBroker {
    pub fn new(conn: diesel::sqlite::SqliteConnection) -> Self {
        Self {
            conn: std::sync::Arc::new(std::sync::Mutex::new(conn)),
        }
    }

    fn run_op<T>(
        &self,
        op: impl FnOnce(&mut diesel::sqlite::SqliteConnection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::Orchestration("sqlite broker mutex poisoned".to_string()))?;
        op(&mut guard)
    }
}

#[cfg(any(test, feature = "sqlite-tests"))]
impl SequenceBroker for SqliteSequenceBroker {
    fn record_height(
        &self,
        height: i64,
        block_hash: String,
        timestamp: i64,
    ) -> BoxFuture<'_, Result<bool, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::record_height(conn, height, &block_hash, timestamp)
                    .map_err(Error::from)
            })
        })
    }

    fn max_recorded_height(&self) -> BoxFuture<'_, Result<Option<i64>, Error>> {
        Box::pin(async move {
            self.run_op(|conn| sequence_manager::max_recorded_height(conn).map_err(Error::from))
        })
    }

    fn frontier(&self, genesis: i64) -> BoxFuture<'_, Result<i64, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::compute_frontier(conn, genesis).map_err(Error::from)
            })
        })
    }

    fn detect_and_enqueue_gaps(
        &self,
        genesis: i64,
        max_new: i64,
    ) -> BoxFuture<'_, Result<GapDetectionReport, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::detect_and_enqueue_gaps(conn, genesis, max_new)
                    .map_err(Error::from)
            })
        })
    }

    fn claim_next_pending_gap(
        &self,
        now_epoch: i64,
    ) -> BoxFuture<'_, Result<Option<GapRange>, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::claim_next_pending_gap(conn, now_epoch).map_err(Error::from)
            })
        })
    }

    fn requeue_gap(
        &self,
        gap_id: i64,
        next_retry_at: Option<i64>,
        last_error: String,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::requeue_gap(conn, gap_id, next_retry_at, &last_error)
                    .map(|_| ())
                    .map_err(Error::from)
            })
        })
    }

    fn resolve_gap(&self, gap_id: i64) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::resolve_gap(conn, gap_id)
                    .map(|_| ())
                    .map_err(Error::from)
            })
        })
    }

    fn mark_gap_stuck(
        &self,
        gap_id: i64,
        last_error: String,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::mark_gap_stuck(conn, gap_id, &last_error)
                    .map(|_| ())
                    .map_err(Error::from)
            })
        })
    }

    fn requeue_in_flight_gaps(&self) -> BoxFuture<'_, Result<usize, Error>> {
        Box::pin(async move {
            self.run_op(|conn| sequence_manager::requeue_in_flight_gaps(conn).map_err(Error::from))
        })
    }

    fn list_missing_heights(
        &self,
        start_height: i64,
        end_height: i64,
    ) -> BoxFuture<'_, Result<Vec<i64>, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::list_missing_heights_in_range(conn, start_height, end_height)
                    .map_err(Error::from)
            })
        })
    }

    fn list_stuck_gaps(&self, limit: i64) -> BoxFuture<'_, Result<Vec<GapRange>, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::list_stuck_gaps(conn, limit).map_err(Error::from)
            })
        })
    }

    fn count_gaps_by_status(&self, status: GapStatus) -> BoxFuture<'_, Result<i64, Error>> {
        Box::pin(async move {
            self.run_op(|conn| {
                sequence_manager::count_gaps_by_status(conn, status).map_err(Error::from)
            })
        })
    }
}
