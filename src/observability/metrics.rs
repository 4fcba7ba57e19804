//! Metrics collection using metrics-rs.

use crate::protocol::{Command, StatusCode};
use metrics::{Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const REQUESTS_TOTAL: &str = "memmap_broker_requests_total";
const BYTES_ALLOCATED_TOTAL: &str = "memmap_broker_bytes_allocated_total";
const REGIONS: &str = "memmap_broker_regions";
const SUBSCRIBERS: &str = "memmap_broker_subscribers";
const REQUEST_TIME_NS: &str = "memmap_broker_request_time_ns";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        REQUESTS_TOTAL,
        Unit::Count,
        "Requests served, by command and status"
    );
    metrics::describe_counter!(
        BYTES_ALLOCATED_TOTAL,
        Unit::Bytes,
        "Total bytes of physical memory allocated by the server"
    );
    metrics::describe_gauge!(REGIONS, Unit::Count, "Regions currently registered");
    metrics::describe_gauge!(SUBSCRIBERS, Unit::Count, "Processes currently registered");
    metrics::describe_histogram!(
        REQUEST_TIME_NS,
        Unit::Nanoseconds,
        "Time to dispatch a single request"
    );
}

/// Record one served request.
#[inline]
pub fn record_request(command: Command, status: StatusCode, elapsed: Duration) {
    counter!(REQUESTS_TOTAL, "command" => command.as_str(), "status" => status.as_str())
        .increment(1);
    histogram!(REQUEST_TIME_NS, "command" => command.as_str()).record(elapsed.as_nanos() as f64);
}

/// Record a new physical allocation.
#[inline]
pub fn record_allocation(bytes: usize) {
    counter!(BYTES_ALLOCATED_TOTAL).increment(bytes as u64);
}

/// Publish the registry's current size.
#[inline]
pub fn record_registry(regions: usize, subscribers: usize) {
    gauge!(REGIONS).set(regions as f64);
    gauge!(SUBSCRIBERS).set(subscribers as f64);
}
