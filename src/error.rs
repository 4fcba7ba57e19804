//! Error types for the broker.

use crate::protocol::StatusCode;
use thiserror::Error;

/// Result type alias using the broker's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for broker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Sending or receiving a datagram failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A live socket is already bound at an endpoint path.
    #[error("endpoint {0} is already in use")]
    EndpointInUse(String),

    /// No response arrived within the configured request timeout.
    #[error("timed out waiting for a response from the broker")]
    Timeout,

    /// The handle accompanying a response was missing or malformed.
    #[error("handle transfer failed: {0}")]
    HandleTransfer(String),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A memory name exceeds the wire capacity.
    #[error("memory name is {len} bytes, limit is {max}")]
    NameTooLong {
        /// Length of the rejected name in bytes.
        len: usize,
        /// Maximum accepted length in bytes.
        max: usize,
    },

    /// A memory name is empty or contains a NUL byte.
    #[error("invalid memory name: {0}")]
    InvalidName(String),

    /// The identity already has a device context bound.
    #[error("device context already bound for pid {0}")]
    ContextAlreadyBound(u32),

    /// The device driver reported a failure.
    #[error("device error: {0}")]
    Device(String),

    /// A caller-supplied argument is out of contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server answered with a non-ACK status.
    #[error("request rejected by broker: {0}")]
    Rejected(StatusCode),

    /// No server is reachable at the well-known endpoint.
    #[error("no broker server at {0}")]
    ServerUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Wire status that best describes this error.
    ///
    /// Transport-level failures map to [`StatusCode::SockErr`], server
    /// rejections keep their status, everything else is
    /// [`StatusCode::UnknownErr`].
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Transport(_) | Error::Timeout | Error::HandleTransfer(_) => StatusCode::SockErr,
            Error::ServerUnavailable(_) | Error::EndpointInUse(_) => StatusCode::SockErr,
            Error::Rejected(status) => *status,
            _ => StatusCode::UnknownErr,
        }
    }

    /// Returns true for failures of the channel rather than of the request.
    pub fn is_transport(&self) -> bool {
        self.status_code() == StatusCode::SockErr
    }
}
