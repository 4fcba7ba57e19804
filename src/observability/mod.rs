//! Observability features: metrics and tracing.
//!
//! ## Metrics
//!
//! The server exposes the following metrics through the `metrics` facade.
//! Install any exporter to collect them.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `memmap_broker_requests_total` | Counter | Requests served, labelled `command`, `status` |
//! | `memmap_broker_bytes_allocated_total` | Counter | Bytes allocated by the server |
//! | `memmap_broker_regions` | Gauge | Registered regions |
//! | `memmap_broker_subscribers` | Gauge | Registered processes |
//! | `memmap_broker_request_time_ns` | Histogram | Dispatch time per request |
//!
//! ## Tracing
//!
//! The serve loop runs inside a `server` span and each request inside a
//! `request` span carrying the command and sender pid.

mod metrics;
mod tracing_support;

pub use metrics::{init_metrics, record_allocation, record_registry, record_request};
pub use tracing_support::{span_request, span_server};
