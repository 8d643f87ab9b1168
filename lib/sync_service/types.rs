use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::RateLimiter;

use crate::chain_client::BlockRecord;

/// Configures worker-level micro retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first attempt.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Configures the macro retry cycle for gap-repair ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRepairPolicy {
    /// Times a range may be requeued before it is parked as stuck.
    pub max_range_attempts: i32,
    /// Base delay before a requeued range becomes claimable again.
    pub base_retry_delay: Duration,
}

impl Default for GapRepairPolicy {
    fn default() -> Self {
        Self {
            max_range_attempts: 3,
            base_retry_delay: Duration::from_secs(30),
        }
    }
}

impl GapRepairPolicy {
    /// Retry-eligibility delay for a range that has already failed `attempts` times.
    pub fn retry_delay(&self, attempts: i32) -> Duration {
        let shift = u32::min(attempts.max(0) as u32, 10);
        let ms = (self.base_retry_delay.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(ms)
    }
}

/// Worker settings shared by the batch, collector, and gap-repair paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestWorkerConfig {
    pub retry_policy: RetryPolicy,
}

/// Shared process-local limiter used to enforce one global request budget across
/// all async ingest workers in a run.
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Outcome from a low-level fetch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBlockResponse {
    Found(BlockRecord),
    /// The source does not have this height yet. A wait-and-poll signal, never a gap.
    NotYetAvailable,
}

/// Normalized fetch failure classes used by worker retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    RateLimited,
    UpstreamUnavailable,
    Unauthorized,
    Forbidden,
    MalformedResponse,
    Other,
}

/// Typed fetch failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Network
                | FetchErrorKind::RateLimited
                | FetchErrorKind::UpstreamUnavailable
        )
    }
}

/// Normalized persistence failure classes used by worker retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    Retryable,
    Fatal,
}

/// Typed persistence failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    pub message: String,
}

impl PersistError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == PersistErrorKind::Retryable
    }
}

/// Enabled persistence targets for one fetched block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageBackend {
    Database,
    File,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageBackend::Database => "database",
            StorageBackend::File => "file",
        }
    }
}

/// Per-height outcome classes shared by all ingestion paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeightOutcomeKind {
    Succeeded,
    NotYetAvailable,
    RetryableFailure,
    FatalFailure,
}

/// Rich per-height outcome with attempt count and failure details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightOutcome {
    pub height: i64,
    pub kind: HeightOutcomeKind,
    pub attempts: u32,
    pub message: Option<String>,
}

impl HeightOutcome {
    pub fn succeeded(height: i64, attempts: u32) -> Self {
        Self {
            height,
            kind: HeightOutcomeKind::Succeeded,
            attempts,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == HeightOutcomeKind::Succeeded
    }
}

/// Aggregate result of one batch ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub not_yet_available: usize,
    /// Heights that failed during the ingestion phase, before any gap repair.
    pub failed: usize,
    /// Heights from this run's window still unrecorded once the run finished,
    /// not counting heights the source has not produced yet.
    pub unresolved: usize,
    pub gaps_detected: usize,
    pub gaps_resolved: usize,
    pub gaps_stuck: usize,
    pub gaps_still_open: usize,
}

impl BatchRunSummary {
    /// A clean run left every height of its window durably recorded and no
    /// open repair work. Judged on end state: a height that failed ingestion
    /// but was filled by the same run's gap repair still counts as clean.
    pub fn is_clean(&self) -> bool {
        self.unresolved == 0 && self.gaps_stuck == 0 && self.gaps_still_open == 0
    }
}
