//! # memmap-broker
//!
//! A per-host broker that lets cooperating processes share device memory.
//!
//! One process on the host is elected server. It owns the device context,
//! creates physical allocations on request, keeps a registry of named and
//! anonymous regions, and hands out shareable handles that other processes
//! import and map into their own device address space. Everyone else is a
//! client talking to it over Unix datagram sockets.
//!
//! ## Features
//!
//! - **Automatic election**: first process wins, stale servers are reclaimed
//! - **Handle transfer**: handles travel as `SCM_RIGHTS`, never as numbers
//! - **rkyv records**: one archive per datagram, bounded names
//! - **Pluggable devices**: [`device::DeviceDriver`] with a memfd host backend
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use memmap_broker::prelude::*;
//!
//! let broker = Broker::instance(BrokerConfig::from_env()?)?;
//! let mut client = broker.connect(ProcessIdentity::current(0))?;
//! client.register()?;
//!
//! // Producer
//! let size = client.rounded_allocation_size(40_000)?;
//! let region = client.allocate(Some("frame"), 0, size)?;
//! region.copy_from_host(0, b"hello")?;
//!
//! // Consumer, in another process
//! let shared = client.import("frame")?;
//! let mut buf = [0u8; 5];
//! shared.copy_to_host(0, &mut buf)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod server;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bootstrap::Broker;
    pub use crate::client::{Client, MappedRegion};
    pub use crate::config::BrokerConfig;
    pub use crate::device::{DeviceAllocation, DeviceDriver, HostDeviceConfig, HostDriver};
    pub use crate::error::{Error, Result};
    pub use crate::identity::ProcessIdentity;
    pub use crate::protocol::{Command, MemName, ShareableHandle, StatusCode};
}

pub use bootstrap::Broker;
pub use client::{Client, Exchange, MappedRegion};
pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use identity::ProcessIdentity;
