//! Per-height ingest worker: fetch once, persist everywhere, report the outcome.

mod core;
mod error_mapping;
mod fetcher;
mod file_store;
mod persister;
mod range_executor;
mod retry;
#[cfg(test)]
pub(crate) mod test_support;

pub use fetcher::{BlockFetcher, HttpBlockFetcher, TipProbe};
pub use file_store::FileBlockPersister;
pub use persister::{BlockPersister, PgBlockPersister};
pub use range_executor::IngestWorker;
pub use retry::compute_backoff_delay;
