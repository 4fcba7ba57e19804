//! Client side of the broker protocol.
//!
//! A [`Client`] owns an endpoint bound at `pid_<pid>.sock` in the runtime
//! directory and talks to the server with one request and one response per
//! call. Allocation and import responses carry a shareable handle, which the
//! client maps into its own device address space and hands back as a
//! [`MappedRegion`].
//!
//! # Example
//!
//! ```rust,ignore
//! use memmap_broker::{Broker, BrokerConfig, ProcessIdentity};
//!
//! let broker = Broker::instance(BrokerConfig::from_env()?)?;
//! let mut client = broker.connect(ProcessIdentity::current(0))?;
//! client.register()?;
//!
//! let size = client.rounded_allocation_size(40_000)?;
//! let region = client.allocate(Some("weights"), 0, size)?;
//! region.copy_from_host(0, b"hello")?;
//! ```

use crate::config::BrokerConfig;
use crate::device::{DeviceAllocation, DeviceDriver};
use crate::error::{Error, Result};
use crate::identity::ProcessIdentity;
use crate::ipc::{Endpoint, recv_with_handles};
use crate::protocol::{
    Command, DeviceAddress, MAX_DATAGRAM_SIZE, MemName, Request, Response, ShareableHandle,
};
use rustix::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One response and the handles that arrived with it.
#[derive(Debug)]
pub struct Exchange {
    /// The decoded response.
    pub response: Response,
    /// Handles from the datagram's ancillary data, `response.handle_count`
    /// of them.
    pub handles: Vec<OwnedFd>,
}

/// A region mapped into this process.
///
/// Dropping it unmaps the local mapping. The region itself stays registered
/// until someone deallocates it.
#[derive(Debug)]
pub struct MappedRegion {
    name: Option<MemName>,
    handle: ShareableHandle,
    server_address: DeviceAddress,
    allocation: DeviceAllocation,
}

impl MappedRegion {
    /// Name the region was allocated under.
    pub fn name(&self) -> Option<&MemName> {
        self.name.as_ref()
    }

    /// Server-side handle identifier, usable with
    /// [`Client::import_handle`] and [`Client::deallocate`].
    pub fn handle(&self) -> ShareableHandle {
        self.handle
    }

    /// Base address of the server's mapping.
    pub fn server_address(&self) -> DeviceAddress {
        self.server_address
    }

    /// Base address of this process's mapping.
    pub fn address(&self) -> DeviceAddress {
        self.allocation.address()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.allocation.len()
    }

    /// Returns true if the region is empty.
    pub fn is_empty(&self) -> bool {
        self.allocation.is_empty()
    }

    /// The local allocation.
    pub fn allocation(&self) -> &DeviceAllocation {
        &self.allocation
    }

    /// Copy host bytes into the region.
    pub fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.allocation.copy_from_host(offset, src)
    }

    /// Copy region bytes to the host.
    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.allocation.copy_to_host(offset, dst)
    }

    /// Take the local allocation, dropping the metadata.
    pub fn into_allocation(self) -> DeviceAllocation {
        self.allocation
    }
}

/// A connection to the broker server.
///
/// Each client has at most one request in flight; every method takes
/// `&mut self`. Requests are numbered, and a response that arrives after its
/// request timed out is discarded by the next request rather than taken as
/// its answer.
pub struct Client {
    endpoint: Endpoint,
    server: PathBuf,
    identity: ProcessIdentity,
    driver: Arc<dyn DeviceDriver>,
    timeout: Option<Duration>,
    next_seq: u64,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint.path())
            .field("server", &self.server)
            .finish()
    }
}

fn expect_ack(response: &Response) -> Result<()> {
    if response.status.is_ack() {
        Ok(())
    } else {
        Err(Error::Rejected(response.status))
    }
}

impl Client {
    /// Bind this identity's endpoint.
    ///
    /// A stale socket file left by a dead process with the same pid is
    /// replaced. Fails with [`Error::EndpointInUse`] if a live client already
    /// holds the endpoint.
    pub fn connect(
        config: &BrokerConfig,
        identity: ProcessIdentity,
        driver: Arc<dyn DeviceDriver>,
    ) -> Result<Self> {
        config.ensure_runtime_dir()?;
        let endpoint =
            Endpoint::bind_reclaiming(config.client_endpoint(&identity.endpoint_name()))?;
        endpoint.set_timeout(config.request_timeout)?;
        tracing::debug!(pid = identity.pid, endpoint = %endpoint.path().display(), "client bound");
        Ok(Self {
            endpoint,
            server: config.server_endpoint(),
            identity,
            driver,
            timeout: config.request_timeout,
            next_seq: 0,
            buf: vec![0u8; MAX_DATAGRAM_SIZE + 1],
        })
    }

    /// This client's identity.
    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Path of this client's endpoint.
    pub fn endpoint_path(&self) -> &Path {
        self.endpoint.path()
    }

    /// Create and bind a device context for this client's device.
    pub fn bind_context(&mut self) -> Result<()> {
        let ctx = self.driver.create_context(self.identity.device_ordinal)?;
        self.identity.bind_context(&ctx)
    }

    /// Change how long requests wait for a response.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.endpoint.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// The request goes out under this client's next sequence number,
    /// whatever `request.seq` holds. Responses to earlier requests that are
    /// still queued are dropped along with their handles.
    ///
    /// The status is not checked; a non-ACK response is still `Ok`. Fails
    /// with a transport error or [`Error::Timeout`] if the exchange itself
    /// fails, and with [`Error::HandleTransfer`] if the number of received
    /// handles disagrees with the response.
    pub fn request(&mut self, request: &Request) -> Result<Exchange> {
        self.next_seq = self.next_seq.wrapping_add(1);
        let seq = self.next_seq;
        let bytes = request.clone().with_seq(seq).to_bytes()?;
        self.endpoint.send_to(&bytes, &self.server)?;

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                self.endpoint.set_timeout(Some(remaining))?;
            }

            let (len, handles) = recv_with_handles(self.endpoint.socket(), &mut self.buf)?;
            let response = Response::from_bytes(&self.buf[..len])?;
            if response.seq != seq {
                tracing::debug!(
                    expected = seq,
                    received = response.seq,
                    handles = handles.len(),
                    "discarding stale response"
                );
                continue;
            }
            if handles.len() != response.handle_count as usize {
                return Err(Error::HandleTransfer(format!(
                    "response announced {} handles, {} received",
                    response.handle_count,
                    handles.len()
                )));
            }
            return Ok(Exchange { response, handles });
        }
    }

    fn call(&mut self, request: Request) -> Result<Exchange> {
        let exchange = self.request(&request)?;
        expect_ack(&exchange.response)?;
        Ok(exchange)
    }

    fn simple(&mut self, command: Command) -> Result<Response> {
        self.call(Request::new(command, self.identity))
            .map(|exchange| exchange.response)
    }

    /// Check that the server answers.
    pub fn echo(&mut self) -> Result<()> {
        self.simple(Command::Echo).map(drop)
    }

    /// Stop the server. Debug and test teardown only.
    pub fn halt(&mut self) -> Result<()> {
        self.simple(Command::Halt).map(drop)
    }

    /// Register this identity with the server.
    ///
    /// Fails with `Rejected(DuplicateRegister)` if the pid is already
    /// registered.
    pub fn register(&mut self) -> Result<()> {
        self.simple(Command::Register).map(drop)
    }

    /// Remove this identity from the server's subscriber set.
    pub fn deregister(&mut self) -> Result<()> {
        self.simple(Command::Deregister).map(drop)
    }

    /// Round `size` up to this client's device allocation granularity.
    pub fn rounded_allocation_size(&mut self, size: usize) -> Result<usize> {
        let request =
            Request::new(Command::GetRoundedAllocationSize, self.identity).with_size(size as u64);
        let response = self.call(request)?.response;
        usize::try_from(response.rounded_size)
            .map_err(|_| Error::Codec(format!("rounded size {} out of range", response.rounded_size)))
    }

    /// Allocate a new region and map it locally.
    ///
    /// `size` must be a multiple of the allocation granularity (see
    /// [`Client::rounded_allocation_size`]); `alignment` is 0 or a power of
    /// two no larger than the granularity. A name that is already taken fails
    /// with `Rejected(DuplicateRegister)`.
    pub fn allocate(
        &mut self,
        name: Option<&str>,
        alignment: usize,
        size: usize,
    ) -> Result<MappedRegion> {
        let mut request = Request::new(Command::Allocate, self.identity)
            .with_size(size as u64)
            .with_alignment(alignment as u64);
        if let Some(name) = name {
            request = request.with_name(MemName::new(name)?);
        }
        let exchange = self.call(request)?;
        self.map_region(exchange)
    }

    /// Map an existing region by name.
    pub fn import(&mut self, name: &str) -> Result<MappedRegion> {
        let request = Request::new(Command::Import, self.identity).with_name(MemName::new(name)?);
        let exchange = self.call(request)?;
        self.map_region(exchange)
    }

    /// Map an existing region by handle.
    pub fn import_handle(&mut self, handle: ShareableHandle) -> Result<MappedRegion> {
        let request = Request::new(Command::Import, self.identity).with_handle(handle);
        let exchange = self.call(request)?;
        self.map_region(exchange)
    }

    /// Drop a region from the registry.
    ///
    /// Mappings already held by any process stay valid until they are
    /// dropped.
    pub fn deallocate(&mut self, handle: ShareableHandle) -> Result<()> {
        let request = Request::new(Command::Deallocate, self.identity).with_handle(handle);
        self.call(request).map(drop)
    }

    fn map_region(&self, exchange: Exchange) -> Result<MappedRegion> {
        let Exchange {
            response,
            mut handles,
        } = exchange;
        let fd = handles
            .pop()
            .ok_or_else(|| Error::HandleTransfer("response carried no handle".into()))?;
        let handle = response
            .handle
            .ok_or_else(|| Error::Codec("acknowledged without a handle id".into()))?;
        let size = usize::try_from(response.rounded_size)
            .map_err(|_| Error::Codec(format!("size {} out of range", response.rounded_size)))?;

        let allocation = self
            .driver
            .import(self.identity.device_ordinal, fd, size)?;
        Ok(MappedRegion {
            name: response.name,
            handle,
            server_address: response.address,
            allocation,
        })
    }
}
