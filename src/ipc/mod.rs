//! Channel plumbing: named datagram endpoints and handle transfer.
//!
//! # Architecture
//!
//! ```text
//!  client                              server
//! ┌────────────────┐  Request        ┌────────────────┐
//! │ pid_<pid>.sock │ ──────────────▶ │  broker.sock   │
//! │                │ ◀────────────── │                │
//! └────────────────┘  Response       └────────────────┘
//!                     (+ SCM_RIGHTS handle for Allocate/Import)
//! ```
//!
//! Endpoints are connectionless: the server learns where to reply from the
//! requester's identity, and every client owns a socket bound to a path
//! derived from its pid.

mod endpoint;
mod handle;

pub use endpoint::{Endpoint, Probe, probe};
pub use handle::{MAX_HANDLES_PER_MESSAGE, recv_with_handles, send_with_handle};
