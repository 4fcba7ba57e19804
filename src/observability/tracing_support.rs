//! Tracing spans for the serve loop and individual requests.

use crate::protocol::Command;
use std::path::Path;
use tracing::{Level, Span, span};

/// Create a span covering the serve loop.
///
/// # Example
///
/// ```rust,ignore
/// use memmap_broker::observability::span_server;
///
/// let _guard = span_server(config.server_endpoint().as_path()).entered();
/// ```
#[inline]
pub fn span_server(endpoint: &Path) -> Span {
    span!(Level::INFO, "server", endpoint = %endpoint.display())
}

/// Create a span for one dispatched request.
#[inline]
pub fn span_request(command: Command, pid: u32) -> Span {
    span!(Level::DEBUG, "request", command = %command, pid = pid)
}
