//! Durable sequence state: known heights, frontier, and gap-range repair queue.
//!
//! Why this module is separate from `db/`:
//! - The logic here is a control-plane policy surface (record/frontier/detect/claim/stuck), not
//!   generic database plumbing.
//! - Keeping it in its own module makes reconciliation invariants easier to reason about.
//!
//! Why this module is synchronous:
//! - Sequence operations are tiny metadata updates compared to the block persistence path.
//! - A sync control plane keeps SQLite-backed unit tests fast and simple, and the same raw SQL
//!   runs unchanged against Postgres in production.
//!
//! Async callers should run these operations in `tokio::task::spawn_blocking` so Tokio runtime
//! worker threads are not blocked.

mod ops;
mod store;
mod types;

pub use ops::{
    claim_next_pending_gap, compute_frontier, count_gaps_by_status, detect_and_enqueue_gaps,
    detect_gaps, enqueue_gap, get_gap, list_gaps_by_status, list_missing_heights_in_range,
    list_stuck_gaps, mark_gap_stuck, max_recorded_height, record_height, requeue_gap,
    requeue_in_flight_gaps, resolve_gap,
};
pub use store::SequenceDb;
pub use types::{GapDetectionReport, GapRange, GapStatus, SequenceStateError};
