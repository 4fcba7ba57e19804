//! Per-command request handling.
//!
//! [`Dispatcher`] owns everything a request can touch: the driver, the
//! server's device state and the registry. It never performs I/O on the
//! endpoint; it turns one [`Request`] into one [`Reply`] and tells the serve
//! loop whether to keep going.

use crate::device::{DeviceContext, DeviceDriver, check_alignment};
use crate::error::{Error, Result};
use crate::identity::{DeviceHandle, ProcessIdentity};
use crate::observability;
use crate::protocol::{Command, Request, Response, ShareableHandle, StatusCode};
use crate::registry::{Registry, RegistryError};
use rustix::fd::OwnedFd;
use std::sync::Arc;

/// Device state created once when the server starts.
#[derive(Debug, Clone)]
pub struct ServerState {
    /// The server's execution context.
    pub context: DeviceContext,
    /// Handles of every device, indexed by ordinal.
    pub devices: Vec<DeviceHandle>,
    /// Number of devices.
    pub device_count: u32,
}

impl ServerState {
    /// Enumerate devices and create a context on device 0.
    pub fn initialize(driver: &dyn DeviceDriver) -> Result<Self> {
        let device_count = driver.device_count();
        if device_count == 0 {
            return Err(Error::Device("no devices available".into()));
        }
        let devices = driver.enumerate();
        let context = driver.create_context(0)?;
        tracing::info!(
            driver = driver.name(),
            devices = device_count,
            "device context created"
        );
        Ok(Self {
            context,
            devices,
            device_count,
        })
    }
}

/// A response plus the handle that travels with it, if any.
#[derive(Debug)]
pub(crate) struct Reply {
    pub response: Response,
    pub handle: Option<OwnedFd>,
}

impl Reply {
    fn status(status: StatusCode, destination: ProcessIdentity) -> Self {
        Self {
            response: Response::new(status, destination),
            handle: None,
        }
    }

    fn ack(destination: ProcessIdentity) -> Self {
        Self::status(StatusCode::Ack, destination)
    }
}

/// What the serve loop does after sending a reply.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Keep serving.
    Continue(Reply),
    /// Stop serving cleanly.
    Halt(Reply),
    /// Stop serving with an error.
    Fatal(Reply, Error),
}

impl Outcome {
    pub(crate) fn reply(&self) -> &Reply {
        match self {
            Outcome::Continue(r) | Outcome::Halt(r) | Outcome::Fatal(r, _) => r,
        }
    }

    fn reply_mut(&mut self) -> &mut Reply {
        match self {
            Outcome::Continue(r) | Outcome::Halt(r) | Outcome::Fatal(r, _) => r,
        }
    }
}

fn registry_status(e: RegistryError) -> StatusCode {
    match e {
        RegistryError::Duplicate => StatusCode::DuplicateRegister,
        RegistryError::NotFound => StatusCode::NotFound,
    }
}

pub(crate) struct Dispatcher {
    driver: Arc<dyn DeviceDriver>,
    state: ServerState,
    registry: Registry,
}

impl Dispatcher {
    pub(crate) fn new(driver: Arc<dyn DeviceDriver>, state: ServerState) -> Self {
        Self {
            driver,
            state,
            registry: Registry::new(),
        }
    }

    pub(crate) fn state(&self) -> &ServerState {
        &self.state
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn dispatch(&mut self, req: &Request) -> Outcome {
        let sender = req.sender;
        let mut outcome = match req.command {
            Command::Echo => Outcome::Continue(Reply::ack(sender)),
            Command::Halt => Outcome::Halt(Reply::ack(sender)),
            Command::Register => Outcome::Continue(self.register(sender)),
            Command::Deregister => Outcome::Continue(self.deregister(sender)),
            Command::GetRoundedAllocationSize => Outcome::Continue(self.rounded_size(req)),
            Command::Allocate => self.allocate(req),
            Command::Import => self.import(req),
            Command::Deallocate => Outcome::Continue(self.deallocate(req)),
        };
        outcome.reply_mut().response.seq = req.seq;
        outcome
    }

    /// Undo an allocation whose reply never reached the requester.
    pub(crate) fn discard_region(&mut self, handle: ShareableHandle) {
        match self.registry.remove(handle) {
            Ok(entry) => tracing::warn!(
                %handle,
                name = ?entry.name.as_ref().map(|n| n.as_str()),
                "discarded undelivered allocation"
            ),
            Err(_) => tracing::debug!(%handle, "undelivered allocation already gone"),
        }
    }

    fn register(&mut self, sender: ProcessIdentity) -> Reply {
        match self.registry.register(sender) {
            Ok(()) => {
                tracing::debug!(pid = sender.pid, "registered");
                Reply::ack(sender)
            }
            Err(e) => Reply::status(registry_status(e), sender),
        }
    }

    fn deregister(&mut self, sender: ProcessIdentity) -> Reply {
        match self.registry.deregister(sender.pid) {
            Ok(_) => {
                tracing::debug!(pid = sender.pid, "deregistered");
                Reply::ack(sender)
            }
            Err(e) => Reply::status(registry_status(e), sender),
        }
    }

    fn rounded_size(&self, req: &Request) -> Reply {
        let rounded = usize::try_from(req.size)
            .map_err(|_| Error::InvalidArgument(format!("size {} out of range", req.size)))
            .and_then(|size| {
                self.driver
                    .rounded_allocation_size(req.sender.device_ordinal, size)
            });
        match rounded {
            Ok(rounded) => {
                let mut reply = Reply::ack(req.sender);
                reply.response.rounded_size = rounded as u64;
                reply
            }
            Err(e) => {
                tracing::debug!(size = req.size, "cannot round: {}", e);
                Reply::status(StatusCode::InvalidRequest, req.sender)
            }
        }
    }

    /// Check size and alignment against the sender's device.
    fn allocation_params(&self, req: &Request) -> Result<(usize, usize)> {
        let ordinal = req.sender.device_ordinal;
        let granularity = self.driver.allocation_granularity(ordinal)?;
        let size = usize::try_from(req.size)
            .map_err(|_| Error::InvalidArgument(format!("size {} out of range", req.size)))?;
        let alignment = usize::try_from(req.alignment).map_err(|_| {
            Error::InvalidArgument(format!("alignment {} out of range", req.alignment))
        })?;
        if size == 0 || size % granularity != 0 {
            return Err(Error::InvalidArgument(format!(
                "size {size} is not a nonzero multiple of granularity {granularity}"
            )));
        }
        check_alignment(alignment, granularity)?;
        Ok((size, alignment))
    }

    fn allocate(&mut self, req: &Request) -> Outcome {
        let sender = req.sender;
        if let Some(name) = &req.name {
            if self.registry.contains_name(name) {
                return Outcome::Continue(Reply::status(StatusCode::DuplicateRegister, sender));
            }
        }
        let (size, alignment) = match self.allocation_params(req) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!(pid = sender.pid, "rejecting allocation: {}", e);
                return Outcome::Continue(Reply::status(StatusCode::InvalidRequest, sender));
            }
        };

        let allocation = match self.driver.create(sender.device_ordinal, size, alignment) {
            Ok(allocation) => allocation,
            Err(e) => return Outcome::Fatal(Reply::status(StatusCode::UnknownErr, sender), e),
        };
        let entry = match self
            .registry
            .insert_region(req.name.clone(), sender, allocation)
        {
            Ok(entry) => entry,
            Err(e) => return Outcome::Continue(Reply::status(registry_status(e), sender)),
        };
        let handle = match entry.allocation().export() {
            Ok(fd) => fd,
            Err(e) => return Outcome::Fatal(Reply::status(StatusCode::UnknownErr, sender), e),
        };

        tracing::info!(
            pid = sender.pid,
            handle = %entry.region.handle,
            name = ?entry.name.as_ref().map(|n| n.as_str()),
            size,
            "allocated"
        );
        observability::record_allocation(size);

        let mut response = Response::ack(sender);
        response.handle = Some(entry.region.handle);
        response.name = entry.name.clone();
        response.rounded_size = entry.region.size as u64;
        response.address = entry.region.base;
        response.handle_count = 1;
        Outcome::Continue(Reply {
            response,
            handle: Some(handle),
        })
    }

    fn import(&mut self, req: &Request) -> Outcome {
        let sender = req.sender;
        let handle = match self.registry.resolve(req.name.as_ref(), req.handle) {
            Ok(handle) => handle,
            Err(e) => return Outcome::Continue(Reply::status(registry_status(e), sender)),
        };
        let Some(entry) = self.registry.lookup_handle(handle) else {
            return Outcome::Continue(Reply::status(StatusCode::NotFound, sender));
        };
        if let Some(source) = &req.import_source {
            if entry.owner.pid != source.pid {
                tracing::debug!(
                    owner = entry.owner.pid,
                    source = source.pid,
                    "import source mismatch"
                );
                return Outcome::Continue(Reply::status(StatusCode::NotFound, sender));
            }
        }
        let fd = match entry.allocation().export() {
            Ok(fd) => fd,
            Err(e) => return Outcome::Fatal(Reply::status(StatusCode::UnknownErr, sender), e),
        };

        let mut response = Response::ack(sender);
        response.handle = Some(entry.region.handle);
        response.name = entry.name.clone();
        response.rounded_size = entry.region.size as u64;
        response.address = entry.region.base;
        response.handle_count = 1;

        if let Err(e) = self.registry.record_importer(handle, sender.pid) {
            return Outcome::Continue(Reply::status(registry_status(e), sender));
        }
        tracing::debug!(pid = sender.pid, %handle, "imported");
        Outcome::Continue(Reply {
            response,
            handle: Some(fd),
        })
    }

    fn deallocate(&mut self, req: &Request) -> Reply {
        let sender = req.sender;
        let removed = self
            .registry
            .resolve(req.name.as_ref(), req.handle)
            .and_then(|handle| self.registry.remove(handle));
        match removed {
            Ok(entry) => {
                tracing::info!(
                    pid = sender.pid,
                    handle = %entry.region.handle,
                    importers = entry.importers.len(),
                    "deallocated"
                );
                let mut response = Response::ack(sender);
                response.handle = Some(entry.region.handle);
                response.name = entry.name.clone();
                response.rounded_size = entry.region.size as u64;
                Reply {
                    response,
                    handle: None,
                }
            }
            Err(e) => Reply::status(registry_status(e), sender),
        }
    }
}
