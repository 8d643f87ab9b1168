use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// We encode this as a labeled gauge with value `1` so the metric is valid for
/// Prometheus text exposition format and still carries stable build labels.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "block_indexer",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

/// Label set for immutable build identity exported on the `indexer_build_info` metric.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone)]
pub struct IndexerMetrics {
    /// Blocks durably persisted and recorded in this process lifetime.
    ///
    /// Throughput-oriented counter. Use PromQL `rate()` for blocks/sec.
    pub blocks_ingested_total: Counter,
    /// Heights that failed ingestion after exhausting micro-retries.
    pub heights_failed_total: Counter,
    /// Gap ranges enqueued by detection passes.
    pub gaps_enqueued_total: Counter,
    /// Gap ranges fully repaired and removed from the queue.
    pub gaps_resolved_total: Counter,
    /// Gap ranges parked for operator attention.
    pub gaps_stuck_total: Counter,
    /// Highest recorded height seen by this process.
    pub highest_recorded_height: Gauge,
    /// Largest height below which the recorded sequence is contiguous.
    pub frontier_height: Gauge,
    /// Latest source tip reported by the upstream API.
    pub source_tip_height: Gauge,
    /// Open (pending + in-flight) gap ranges after the last pass.
    pub open_gap_ranges: Gauge,
}

impl IndexerMetrics {
    fn init() -> Self {
        Self {
            blocks_ingested_total: Counter::default(),
            heights_failed_total: Counter::default(),
            gaps_enqueued_total: Counter::default(),
            gaps_resolved_total: Counter::default(),
            gaps_stuck_total: Counter::default(),
            highest_recorded_height: Gauge::default(),
            frontier_height: Gauge::default(),
            source_tip_height: Gauge::default(),
            open_gap_ranges: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "blocks_ingested",
            "Total number of blocks durably persisted and recorded",
            metrics.blocks_ingested_total.clone(),
        );
        sub_registry.register(
            "heights_failed",
            "Total number of heights that failed ingestion after retries",
            metrics.heights_failed_total.clone(),
        );
        sub_registry.register(
            "gaps_enqueued",
            "Total number of gap ranges enqueued by detection passes",
            metrics.gaps_enqueued_total.clone(),
        );
        sub_registry.register(
            "gaps_resolved",
            "Total number of gap ranges fully repaired",
            metrics.gaps_resolved_total.clone(),
        );
        sub_registry.register(
            "gaps_stuck",
            "Total number of gap ranges parked for operator attention",
            metrics.gaps_stuck_total.clone(),
        );
        sub_registry.register(
            "highest_recorded_height",
            "Highest block height recorded by this process",
            metrics.highest_recorded_height.clone(),
        );
        sub_registry.register(
            "frontier_height",
            "Largest height up to which the recorded sequence is gap-free",
            metrics.frontier_height.clone(),
        );
        sub_registry.register(
            "source_tip_height",
            "Latest source tip height reported by the upstream API",
            metrics.source_tip_height.clone(),
        );
        sub_registry.register(
            "open_gap_ranges",
            "Open (pending + in-flight) gap ranges after the last pass",
            metrics.open_gap_ranges.clone(),
        );
        metrics
    }
}

pub static INDEXER_METRICS: OnceCell<IndexerMetrics> = OnceCell::const_new();
