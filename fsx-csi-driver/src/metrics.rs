//! Prometheus metrics for the provisioning core
//!
//! Provides metrics for monitoring driver operations, backing-store retries,
//! volume lifecycle and attachments.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of driver operations by type and status
    pub const OPERATIONS_TOTAL: &str = "fsx_csi_operations_total";
    /// Histogram: Duration of driver operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "fsx_csi_operation_duration_seconds";
    /// Counter: Number of retried backing-store calls
    pub const RETRIES_TOTAL: &str = "fsx_csi_retries_total";
    /// Gauge: Number of tracked volumes by lifecycle state
    pub const VOLUMES: &str = "fsx_csi_volumes";
    /// Gauge: Number of active attachments
    pub const ATTACHMENTS: &str = "fsx_csi_attachments";
    /// Counter: Describe calls issued by pollers, by outcome
    pub const POLL_ITERATIONS_TOTAL: &str = "fsx_csi_poll_iterations_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a driver operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Set the number of volumes in one lifecycle state
pub fn set_volume_count(state: &str, count: usize) {
    gauge!(names::VOLUMES, "state" => state.to_string()).set(count as f64);
}

/// Set the number of active attachments
pub fn set_attachment_count(count: usize) {
    gauge!(names::ATTACHMENTS).set(count as f64);
}

/// Record one poll iteration
pub fn record_poll(outcome: &str) {
    counter!(names::POLL_ITERATIONS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }

    /// Complete the operation from its result
    pub fn finish<T>(self, result: &crate::Result<T>) {
        match result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer_without_recorder() {
        // No recorder installed: recording must be a silent no-op
        let timer = OperationTimer::new("create_volume");
        timer.failure("InvalidSubnet");

        let timer = OperationTimer::new("delete_volume");
        timer.finish::<()>(&Ok(()));

        set_volume_count("ready", 3);
        record_poll("creating");
    }
}
