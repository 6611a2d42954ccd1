//! Metrics collection and Prometheus export.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use seqcache_core::{MemoryError, MemoryResult};
use std::net::SocketAddr;

/// Metrics recorder for cache operations.
///
/// Every method is a cheap no-op until a recorder is installed.
#[derive(Debug, Clone, Copy)]
pub struct CacheMetrics;

impl CacheMetrics {
    /// Initialize the metrics system and start the Prometheus exporter.
    ///
    /// # Arguments
    /// * `port` - Port for the Prometheus metrics endpoint
    pub fn init(port: u16) -> MemoryResult<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| MemoryError::internal(format!("metrics init failed: {e}")))?;

        Self::register_metrics();

        Ok(Self)
    }

    /// Metrics without an exporter (tests, CLI runs).
    pub fn init_noop() -> Self {
        Self
    }

    fn register_metrics() {
        // Batch metrics
        describe_counter!(
            "seqcache_batches_total",
            "Total number of batches prepared successfully"
        );
        describe_counter!(
            "seqcache_ubatches_total",
            "Total number of micro-batches applied"
        );
        describe_counter!(
            "seqcache_prepare_failed",
            "Batches rejected because the memory had no room"
        );
        describe_counter!(
            "seqcache_compute_failed",
            "Batches rolled back after a compute failure"
        );
        describe_counter!(
            "seqcache_updates_total",
            "Maintenance passes (K-shift, defragmentation) applied"
        );

        // Latency metrics
        describe_histogram!(
            "seqcache_decode_latency_ms",
            "Prepare, compute and apply latency per batch in milliseconds"
        );
        describe_histogram!(
            "seqcache_state_bytes",
            "Size of saved or restored state in bytes"
        );

        // Occupancy metrics
        describe_gauge!("seqcache_cells_used", "Occupied cells or slots");
        describe_gauge!("seqcache_cells_total", "Capacity in cells or slots");
    }

    /// Record a batch that was prepared and fully applied.
    pub fn batch_applied(&self, n_ubatches: usize) {
        counter!("seqcache_batches_total").increment(1);
        counter!("seqcache_ubatches_total").increment(n_ubatches as u64);
    }

    /// Record a batch rejected at prepare.
    pub fn prepare_failed(&self) {
        counter!("seqcache_prepare_failed").increment(1);
    }

    /// Record a batch rolled back after compute failed.
    pub fn compute_failed(&self) {
        counter!("seqcache_compute_failed").increment(1);
    }

    /// Record an applied maintenance pass.
    pub fn update_applied(&self) {
        counter!("seqcache_updates_total").increment(1);
    }

    /// Record decode latency.
    pub fn record_decode_latency(&self, ms: f64) {
        histogram!("seqcache_decode_latency_ms").record(ms);
    }

    pub fn record_state_bytes(&self, bytes: usize) {
        histogram!("seqcache_state_bytes").record(bytes as f64);
    }

    /// Set occupancy for the memory labelled `kind`.
    pub fn set_occupancy(&self, kind: &'static str, used: u32, size: u32) {
        gauge!("seqcache_cells_used", "kind" => kind).set(used as f64);
        gauge!("seqcache_cells_total", "kind" => kind).set(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_noop() {
        let metrics = CacheMetrics::init_noop();

        // These should not panic even without a recorder
        metrics.batch_applied(3);
        metrics.prepare_failed();
        metrics.compute_failed();
        metrics.update_applied();
        metrics.record_decode_latency(1.5);
        metrics.record_state_bytes(4096);
        metrics.set_occupancy("unified", 10, 64);
    }
}
