use thiserror::Error;

/// Error type for sequence-control CRUD operations.
#[derive(Debug, Error)]
pub enum SequenceStateError {
    #[error("database operation failed: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("invalid gap status value in database: {0}")]
    InvalidGapStatus(String),
    #[error("invalid sequence-state input: {0}")]
    InvalidInput(String),
}

/// Durable lifecycle states for a gap-repair range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    Pending,
    InFlight,
    Stuck,
}

impl GapStatus {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            GapStatus::Pending => "pending",
            GapStatus::InFlight => "in_flight",
            GapStatus::Stuck => "stuck",
        }
    }

    pub(crate) fn from_db_str(value: &str) -> Result<Self, SequenceStateError> {
        match value {
            "pending" => Ok(GapStatus::Pending),
            "in_flight" => Ok(GapStatus::InFlight),
            "stuck" => Ok(GapStatus::Stuck),
            other => Err(SequenceStateError::InvalidGapStatus(other.to_string())),
        }
    }
}

/// Materialized row from `gap_ranges`.
///
/// Identity is `(start_height, end_height)`; two ranges with the same bounds
/// are the same logical repair task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRange {
    pub gap_id: i64,
    pub start_height: i64,
    pub end_height: i64,
    pub status: GapStatus,
    pub attempts: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Outcome of one gap-detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapDetectionReport {
    /// Highest recorded height at scan time; `None` for an empty store.
    pub observed_max: Option<i64>,
    /// Maximal missing ranges found by the pairwise scan, in order.
    pub detected_ranges: Vec<(i64, i64)>,
    /// Ranges newly enqueued this pass.
    pub enqueued: usize,
    /// Ranges skipped because an open (pending/in-flight/stuck) row already covers them.
    pub already_open: usize,
}
