//! Request and response records.

use super::name::MemName;
use crate::identity::ProcessIdentity;

/// Command carried by a [`Request`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum Command {
    /// Liveness probe.
    Echo = 1,
    /// Stop the serve loop. Debug and test teardown only.
    Halt = 2,
    /// Add the sender to the subscriber set.
    Register = 3,
    /// Remove the sender from the subscriber set.
    Deregister = 4,
    /// Create a new physical allocation and return its handle.
    Allocate = 5,
    /// Drop a registry entry and the server's reference to it.
    Deallocate = 6,
    /// Obtain the handle of an existing region.
    Import = 7,
    /// Round a byte count up to the device allocation granularity.
    GetRoundedAllocationSize = 8,
}

impl Command {
    /// Whether a successful response to this command carries a handle.
    pub fn carries_handle(&self) -> bool {
        matches!(self, Self::Allocate | Self::Import)
    }

    /// Short lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Halt => "halt",
            Self::Register => "register",
            Self::Deregister => "deregister",
            Self::Allocate => "allocate",
            Self::Deallocate => "deallocate",
            Self::Import => "import",
            Self::GetRoundedAllocationSize => "get_rounded_allocation_size",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported in a [`Response`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum StatusCode {
    /// Success.
    Ack = 1,
    /// Recognized but not implemented.
    Nyi = 2,
    /// Transport failure.
    SockErr = 3,
    /// The identity or name is already registered.
    DuplicateRegister = 4,
    /// Any other failure.
    UnknownErr = 5,
    /// No registry entry matches the request.
    NotFound = 6,
    /// The request is malformed or violates its contract.
    InvalidRequest = 7,
}

impl StatusCode {
    /// Whether this is [`StatusCode::Ack`].
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    /// Short uppercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Nyi => "NYI",
            Self::SockErr => "SOCKERR",
            Self::DuplicateRegister => "DUPLICATE_REGISTER",
            Self::UnknownErr => "UNKNOWN_ERR",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side identifier of an exported allocation.
///
/// The value is opaque to clients; the underlying resource travels separately
/// as ancillary data.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct ShareableHandle(pub u64);

impl std::fmt::Display for ShareableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address in a device virtual address space.
pub type DeviceAddress = u64;

/// A request sent from a client endpoint to the server endpoint.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct Request {
    /// What to do.
    pub command: Command,
    /// Sequence number chosen by the sender, echoed in the response.
    pub seq: u64,
    /// Who is asking; the response goes to this identity's endpoint.
    pub sender: ProcessIdentity,
    /// Handle operand for Import and Deallocate.
    pub handle: Option<ShareableHandle>,
    /// Name operand for Allocate, Import and Deallocate.
    pub name: Option<MemName>,
    /// Size in bytes.
    pub size: u64,
    /// Requested alignment in bytes, 0 for the device default.
    pub alignment: u64,
    /// For Import, the process the region must originate from.
    pub import_source: Option<ProcessIdentity>,
}

impl Request {
    /// Create a request with empty operands.
    pub fn new(command: Command, sender: ProcessIdentity) -> Self {
        Self {
            command,
            seq: 0,
            sender,
            handle: None,
            name: None,
            size: 0,
            alignment: 0,
            import_source: None,
        }
    }

    /// Set the sequence number.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Set the name operand.
    pub fn with_name(mut self, name: MemName) -> Self {
        self.name = Some(name);
        self
    }

    /// Set the handle operand.
    pub fn with_handle(mut self, handle: ShareableHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Set the size operand.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set the alignment operand.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Restrict an Import to regions allocated by `source`.
    pub fn with_import_source(mut self, source: ProcessIdentity) -> Self {
        self.import_source = Some(source);
        self
    }
}

/// A response sent from the server back to the requester's endpoint.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct Response {
    /// Outcome. Check this before trusting any other field.
    pub status: StatusCode,
    /// Sequence number of the request this answers. Zero when the request
    /// could not be decoded.
    pub seq: u64,
    /// The identity this response is addressed to.
    pub destination: ProcessIdentity,
    /// Handle of the region the request concerned.
    pub handle: Option<ShareableHandle>,
    /// Name of that region, echoed back.
    pub name: Option<MemName>,
    /// Rounded or region size in bytes.
    pub rounded_size: u64,
    /// Base address of the region in the server's device address space.
    pub address: DeviceAddress,
    /// Number of handles in this datagram's ancillary data.
    pub handle_count: u32,
}

impl Response {
    /// Create a response with empty payload.
    pub fn new(status: StatusCode, destination: ProcessIdentity) -> Self {
        Self {
            status,
            seq: 0,
            destination,
            handle: None,
            name: None,
            rounded_size: 0,
            address: 0,
            handle_count: 0,
        }
    }

    /// Create an ACK response.
    pub fn ack(destination: ProcessIdentity) -> Self {
        Self::new(StatusCode::Ack, destination)
    }
}
