use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Engine].
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Number of cycles started
    pub cycles: Counter,
    /// Number of cycles committed
    pub commits: Counter,
    /// Number of cycles aborted by the pipeline
    pub aborts: Counter,
    /// Number of messages included in committed blocks
    pub messages: Counter,
    /// Number of neighbor fetches that were unavailable
    pub unavailable: Counter,
    /// Number of neighbor fetches for unknown shards
    pub unknown: Counter,
    /// Last committed local height
    pub height: Gauge,
    /// Number of tracked neighbors
    pub neighbors: Gauge,
    /// Number of neighbors whose advancement is halted
    pub halted: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("cycles", "Number of cycles started", metrics.cycles.clone());
        context.register(
            "commits",
            "Number of cycles committed",
            metrics.commits.clone(),
        );
        context.register(
            "aborts",
            "Number of cycles aborted by the pipeline",
            metrics.aborts.clone(),
        );
        context.register(
            "messages",
            "Number of messages included in committed blocks",
            metrics.messages.clone(),
        );
        context.register(
            "unavailable",
            "Number of neighbor fetches that were unavailable",
            metrics.unavailable.clone(),
        );
        context.register(
            "unknown",
            "Number of neighbor fetches for unknown shards",
            metrics.unknown.clone(),
        );
        context.register(
            "height",
            "Last committed local height",
            metrics.height.clone(),
        );
        context.register(
            "neighbors",
            "Number of tracked neighbors",
            metrics.neighbors.clone(),
        );
        context.register(
            "halted",
            "Number of neighbors whose advancement is halted",
            metrics.halted.clone(),
        );
        metrics
    }
}
