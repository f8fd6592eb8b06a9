use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [Cache](crate::Cache).
#[derive(Default)]
pub(crate) struct Metrics {
    /// Number of buffers in the index
    pub buffers: Gauge,
    /// Number of buffers on the delayed-write queue
    pub delwri: Gauge,
    /// Number of unmapped address ranges not yet purged
    pub pending_unmaps: Gauge,
    /// Number of buffers written by the flush daemon or an explicit flush
    pub flushed: Counter,
    /// Number of failed transfers
    pub io_errors: Counter,
    /// Number of page resolution retries
    pub page_retries: Counter,
    /// Number of buffers destroyed
    pub destroyed: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "buffers",
            "Number of buffers in the index",
            metrics.buffers.clone(),
        );
        context.register(
            "delwri",
            "Number of buffers on the delayed-write queue",
            metrics.delwri.clone(),
        );
        context.register(
            "pending_unmaps",
            "Number of unmapped address ranges not yet purged",
            metrics.pending_unmaps.clone(),
        );
        context.register(
            "flushed",
            "Number of buffers written by the flush daemon or an explicit flush",
            metrics.flushed.clone(),
        );
        context.register(
            "io_errors",
            "Number of failed transfers",
            metrics.io_errors.clone(),
        );
        context.register(
            "page_retries",
            "Number of page resolution retries",
            metrics.page_retries.clone(),
        );
        context.register(
            "destroyed",
            "Number of buffers destroyed",
            metrics.destroyed.clone(),
        );
        metrics
    }
}
