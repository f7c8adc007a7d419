//! Core metrics definitions.
//!
//! Counters follow Prometheus naming conventions with a `_total` suffix.

use metrics::describe_counter;

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    describe_counter!("lanshim_shim_created_total", "Shim interfaces created");
    describe_counter!("lanshim_shim_removed_total", "Shim interfaces removed");
    describe_counter!("lanshim_routes_added_total", "Service host routes added");
    describe_counter!("lanshim_routes_removed_total", "Service host routes removed");
    describe_counter!(
        "lanshim_readiness_attempts_total",
        "Readiness probe attempts, across all checks"
    );
}
