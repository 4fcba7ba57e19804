//! Device memory operations.
//!
//! The broker consumes a small slice of a GPU driver API: device enumeration,
//! context creation, the allocation-granularity query, physical allocation
//! with export to a shareable OS handle, import of such a handle, mapping into
//! the device address space, and host/device copies. [`DeviceDriver`] is that
//! seam.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   create()/import()   ┌──────────────────────┐
//! │ DeviceDriver │ ────────────────────▶ │   DeviceAllocation   │
//! └──────────────┘                       │  physical pages      │
//!        │                               │  + device mapping    │
//!        │ allocation_granularity()      │  + shareable fd      │
//!        ▼                               └──────────┬───────────┘
//!   round_to_granularity()                          │ export()
//!                                                   ▼
//!                                        OwnedFd → SCM_RIGHTS
//! ```
//!
//! [`HostDriver`] implements the seam with `memfd` allocations, so physical
//! pages are shared between processes exactly the way exported GPU handles
//! are.

mod host;

pub use host::{HostDeviceConfig, HostDriver};

use crate::error::{Error, Result};
use crate::identity::{ContextHandle, DeviceHandle};
use crate::protocol::DeviceAddress;
use rustix::fd::{BorrowedFd, OwnedFd};

/// An execution context created on one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceContext {
    /// Ordinal of the device.
    pub ordinal: u32,
    /// Driver handle of the device.
    pub device: DeviceHandle,
    /// Driver handle of the context.
    pub handle: ContextHandle,
}

/// Round `size` up to the next multiple of `granularity`.
///
/// Returns `None` when `granularity` is zero or the result overflows.
/// Rounding is idempotent: an already rounded size is returned unchanged.
#[inline]
pub fn round_to_granularity(size: usize, granularity: usize) -> Option<usize> {
    if granularity == 0 {
        return None;
    }
    size.checked_next_multiple_of(granularity)
}

/// Check an alignment request against a device granularity.
///
/// Zero means "device default". Otherwise the alignment must be a power of
/// two no larger than the granularity.
pub fn check_alignment(alignment: usize, granularity: usize) -> Result<()> {
    if alignment == 0 {
        return Ok(());
    }
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidArgument(format!(
            "alignment {alignment} is not a power of two"
        )));
    }
    if alignment > granularity {
        return Err(Error::InvalidArgument(format!(
            "alignment {alignment} exceeds granularity {granularity}"
        )));
    }
    Ok(())
}

/// Physical device memory mapped into the current process's device address
/// space.
///
/// Implementations must keep [`DeviceMemory::address`] valid for
/// [`DeviceMemory::len`] bytes until dropped, and release both the mapping and
/// the physical allocation reference on drop.
pub trait DeviceMemory: Send + Sync + std::fmt::Debug {
    /// Base address of the mapping.
    fn address(&self) -> DeviceAddress;

    /// Size of the mapping in bytes.
    fn len(&self) -> usize;

    /// The shareable OS handle backing this allocation.
    fn shareable_fd(&self) -> BorrowedFd<'_>;

    /// Copy host bytes into device memory at `offset`.
    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()>;

    /// Copy device memory at `offset` into host bytes.
    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()>;
}

/// A mapped physical allocation on one device.
///
/// Dropping the allocation unmaps it and releases this process's reference to
/// the physical pages. The pages themselves live until every process holding
/// a handle or mapping has released it.
#[derive(Debug)]
pub struct DeviceAllocation {
    ordinal: u32,
    memory: Box<dyn DeviceMemory>,
}

impl DeviceAllocation {
    /// Wrap a backend mapping.
    pub fn new(ordinal: u32, memory: Box<dyn DeviceMemory>) -> Self {
        Self { ordinal, memory }
    }

    /// Device the allocation lives on.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Base address in the device address space.
    pub fn address(&self) -> DeviceAddress {
        self.memory.address()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Returns true if the allocation has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the shareable handle.
    pub fn shareable_fd(&self) -> BorrowedFd<'_> {
        self.memory.shareable_fd()
    }

    /// Export a new owned reference to the shareable handle, suitable for
    /// sending to another process.
    pub fn export(&self) -> Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(self.shareable_fd(), 0)?)
    }

    /// Host-to-device copy.
    pub fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.memory.copy_from_host(offset, src)
    }

    /// Device-to-host copy.
    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.memory.copy_to_host(offset, dst)
    }
}

/// The GPU driver surface used by the broker.
///
/// All methods take `&self`; drivers are shared between the serve loop and
/// clients in the same process.
pub trait DeviceDriver: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Number of devices.
    fn device_count(&self) -> u32;

    /// Handles of all devices, indexed by ordinal.
    fn enumerate(&self) -> Vec<DeviceHandle> {
        (0..self.device_count())
            .map(|ordinal| DeviceHandle(ordinal as i32))
            .collect()
    }

    /// Create an execution context on a device.
    fn create_context(&self, ordinal: u32) -> Result<DeviceContext>;

    /// Minimum allocation granularity of a device in bytes.
    fn allocation_granularity(&self, ordinal: u32) -> Result<usize>;

    /// Create a physical allocation of `size` bytes and map it.
    ///
    /// `size` must already be a multiple of the granularity.
    fn create(&self, ordinal: u32, size: usize, alignment: usize) -> Result<DeviceAllocation>;

    /// Import a shareable handle exported by another process and map it.
    fn import(&self, ordinal: u32, handle: OwnedFd, size: usize) -> Result<DeviceAllocation>;

    /// Smallest multiple of the device granularity that is at least `size`.
    fn rounded_allocation_size(&self, ordinal: u32, size: usize) -> Result<usize> {
        let granularity = self.allocation_granularity(ordinal)?;
        round_to_granularity(size, granularity).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{size} bytes cannot be rounded to granularity {granularity}"
            ))
        })
    }

    /// Fail unless `ordinal` names a device.
    fn check_ordinal(&self, ordinal: u32) -> Result<()> {
        if ordinal >= self.device_count() {
            return Err(Error::InvalidArgument(format!(
                "device ordinal {} out of range ({} devices)",
                ordinal,
                self.device_count()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB_64: usize = 64 * 1024;

    #[test]
    fn test_round_40000_to_64k() {
        assert_eq!(round_to_granularity(40_000, KIB_64), Some(65_536));
    }

    #[test]
    fn test_round_properties() {
        for granularity in [4096, KIB_64, 2 * 1024 * 1024] {
            for size in [0, 1, 4095, 4096, 40_000, 65_536, 65_537, 3 << 20, (1 << 30) + 7] {
                let rounded = round_to_granularity(size, granularity).unwrap();
                assert!(rounded >= size);
                assert_eq!(rounded % granularity, 0);
                assert!(rounded - size < granularity);
                assert_eq!(round_to_granularity(rounded, granularity), Some(rounded));
            }
        }
    }

    #[test]
    fn test_round_overflow_and_zero_granularity() {
        assert_eq!(round_to_granularity(usize::MAX, KIB_64), None);
        assert_eq!(round_to_granularity(10, 0), None);
    }

    #[test]
    fn test_check_alignment() {
        assert!(check_alignment(0, KIB_64).is_ok());
        assert!(check_alignment(1024, KIB_64).is_ok());
        assert!(check_alignment(KIB_64, KIB_64).is_ok());
        assert!(check_alignment(3000, KIB_64).is_err());
        assert!(check_alignment(2 * KIB_64, KIB_64).is_err());
    }
}
