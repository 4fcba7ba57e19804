//! Host device backend using Linux memfd.
//!
//! Physical allocations are anonymous memfd files, the shareable handle is
//! the memfd descriptor, and the "device mapping" is a `MAP_SHARED` mmap of
//! it. Passing the descriptor to another process via `SCM_RIGHTS` and mapping
//! it there yields the same physical pages, which is the property the broker
//! needs from a GPU driver's export/import path.

use super::{DeviceAllocation, DeviceContext, DeviceDriver, DeviceMemory, check_alignment};
use crate::error::{Error, Result};
use crate::identity::{ContextHandle, DeviceHandle};
use crate::protocol::DeviceAddress;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default allocation granularity (2 MiB, the usual GPU VMM granularity).
pub const DEFAULT_GRANULARITY: usize = 2 * 1024 * 1024;

/// Shape of the simulated device set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceConfig {
    /// Number of devices.
    pub device_count: u32,
    /// Allocation granularity in bytes, shared by all devices.
    pub granularity: usize,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            granularity: DEFAULT_GRANULARITY,
        }
    }
}

impl HostDeviceConfig {
    /// Set the device count.
    pub fn with_device_count(mut self, device_count: u32) -> Self {
        self.device_count = device_count;
        self
    }

    /// Set the allocation granularity.
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }
}

/// Driver backed by memfd allocations.
#[derive(Debug)]
pub struct HostDriver {
    config: HostDeviceConfig,
    next_context: AtomicU64,
}

impl HostDriver {
    /// Create a driver.
    ///
    /// # Errors
    ///
    /// Fails if there are no devices or the granularity is not a power-of-two
    /// multiple of the system page size.
    pub fn new(config: HostDeviceConfig) -> Result<Self> {
        if config.device_count == 0 {
            return Err(Error::Device("no devices configured".into()));
        }
        let page = rustix::param::page_size();
        if !config.granularity.is_power_of_two() || config.granularity < page {
            return Err(Error::Device(format!(
                "granularity {} must be a power of two and at least the page size {}",
                config.granularity, page
            )));
        }
        Ok(Self {
            config,
            next_context: AtomicU64::new(1),
        })
    }

    /// The configuration this driver was built from.
    pub fn config(&self) -> &HostDeviceConfig {
        &self.config
    }
}

impl DeviceDriver for HostDriver {
    fn name(&self) -> &str {
        "host-memfd"
    }

    fn device_count(&self) -> u32 {
        self.config.device_count
    }

    fn create_context(&self, ordinal: u32) -> Result<DeviceContext> {
        self.check_ordinal(ordinal)?;
        Ok(DeviceContext {
            ordinal,
            device: DeviceHandle(ordinal as i32),
            handle: ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed)),
        })
    }

    fn allocation_granularity(&self, ordinal: u32) -> Result<usize> {
        self.check_ordinal(ordinal)?;
        Ok(self.config.granularity)
    }

    fn create(&self, ordinal: u32, size: usize, alignment: usize) -> Result<DeviceAllocation> {
        self.check_ordinal(ordinal)?;
        check_alignment(alignment, self.config.granularity)?;
        if size == 0 || size % self.config.granularity != 0 {
            return Err(Error::InvalidArgument(format!(
                "size {} is not a nonzero multiple of granularity {}",
                size, self.config.granularity
            )));
        }

        let name = CString::new(format!("memmap-broker:dev{ordinal}"))
            .map_err(|e| Error::Device(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let memory = HostMemory::map(fd, size, alignment)?;
        Ok(DeviceAllocation::new(ordinal, Box::new(memory)))
    }

    fn import(&self, ordinal: u32, handle: OwnedFd, size: usize) -> Result<DeviceAllocation> {
        self.check_ordinal(ordinal)?;
        if size == 0 {
            return Err(Error::InvalidArgument("cannot import an empty region".into()));
        }
        let stat = rustix::fs::fstat(&handle)?;
        if (stat.st_size as u64) < size as u64 {
            return Err(Error::Device(format!(
                "handle backs {} bytes, {} requested",
                stat.st_size, size
            )));
        }

        let memory = HostMemory::map(handle, size, 0)?;
        Ok(DeviceAllocation::new(ordinal, Box::new(memory)))
    }
}

/// A memfd mapped into this process.
#[derive(Debug)]
struct HostMemory {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMemory {
    /// Map `len` bytes of `fd` at an address aligned to `alignment`.
    fn map(fd: OwnedFd, len: usize, alignment: usize) -> Result<Self> {
        let page = rustix::param::page_size();
        let ptr = if alignment <= page {
            // mmap results are always page aligned
            unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    &fd,
                    0,
                )?
            }
        } else {
            unsafe { Self::map_aligned(&fd, len, alignment)? }
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Device("mmap returned null".into()))?;

        Ok(Self { fd, ptr, len })
    }

    /// Reserve `len + alignment` bytes, place the shared mapping at the first
    /// aligned address inside the reservation and release the slack.
    unsafe fn map_aligned(
        fd: &OwnedFd,
        len: usize,
        alignment: usize,
    ) -> Result<*mut std::ffi::c_void> {
        let reserve_len = len + alignment;
        let reserved = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                reserve_len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )?
        };
        let start = reserved as usize;
        let aligned = start.next_multiple_of(alignment);
        let head = aligned - start;
        let tail = reserve_len - head - len;

        let mapped = unsafe {
            rustix::mm::mmap(
                aligned as *mut std::ffi::c_void,
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED | MapFlags::FIXED,
                fd,
                0,
            )
        };
        let mapped = match mapped {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe {
                    let _ = rustix::mm::munmap(reserved, reserve_len);
                }
                return Err(e.into());
            }
        };

        unsafe {
            if head > 0 {
                let _ = rustix::mm::munmap(reserved, head);
            }
            if tail > 0 {
                let _ = rustix::mm::munmap((aligned + len) as *mut std::ffi::c_void, tail);
            }
        }
        Ok(mapped)
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "range {}+{} outside allocation of {} bytes",
                offset, count, self.len
            ))),
        }
    }
}

impl DeviceMemory for HostMemory {
    fn address(&self) -> DeviceAddress {
        self.ptr.as_ptr() as DeviceAddress
    }

    fn len(&self) -> usize {
        self.len
    }

    fn shareable_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: range checked above; the mapping is live for &self.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: range checked above; the mapping is live for &self.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping is process-wide shared memory with no thread-local
// state; the fd is reference-counted by the kernel. Concurrent access to the
// bytes is the caller's responsibility, as with any device memory.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB_64: usize = 64 * 1024;

    fn driver() -> HostDriver {
        HostDriver::new(
            HostDeviceConfig::default()
                .with_device_count(2)
                .with_granularity(KIB_64),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(HostDriver::new(HostDeviceConfig::default().with_device_count(0)).is_err());
        assert!(HostDriver::new(HostDeviceConfig::default().with_granularity(3 * 4096)).is_err());
        assert!(HostDriver::new(HostDeviceConfig::default().with_granularity(512)).is_err());
    }

    #[test]
    fn test_enumerate_and_contexts() {
        let drv = driver();
        assert_eq!(drv.device_count(), 2);
        assert_eq!(drv.enumerate(), vec![DeviceHandle(0), DeviceHandle(1)]);

        let a = drv.create_context(1).unwrap();
        let b = drv.create_context(1).unwrap();
        assert_eq!(a.ordinal, 1);
        assert_ne!(a.handle, b.handle);
        assert!(drv.create_context(2).is_err());
    }

    #[test]
    fn test_rounded_allocation_size() {
        let drv = driver();
        assert_eq!(drv.rounded_allocation_size(0, 40_000).unwrap(), 65_536);
        assert!(drv.rounded_allocation_size(5, 1).is_err());
        assert!(drv.rounded_allocation_size(0, usize::MAX).is_err());
    }

    #[test]
    fn test_create_requires_rounded_size() {
        let drv = driver();
        assert!(drv.create(0, 40_000, 0).is_err());
        assert!(drv.create(0, 0, 0).is_err());
        let alloc = drv.create(0, KIB_64, 1024).unwrap();
        assert_eq!(alloc.len(), KIB_64);
        assert_ne!(alloc.address(), 0);
    }

    #[test]
    fn test_create_honours_large_alignment() {
        let drv = driver();
        let alloc = drv.create(1, 2 * KIB_64, KIB_64).unwrap();
        assert_eq!(alloc.address() % KIB_64 as u64, 0);
        alloc.copy_from_host(2 * KIB_64 - 4, b"tail").unwrap();
        let mut buf = [0u8; 4];
        alloc.copy_to_host(2 * KIB_64 - 4, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn test_copy_bounds_checked() {
        let drv = driver();
        let alloc = drv.create(0, KIB_64, 0).unwrap();
        assert!(alloc.copy_from_host(KIB_64 - 1, b"xy").is_err());
        let mut buf = [0u8; 8];
        assert!(alloc.copy_to_host(usize::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_export_import_shares_pages() {
        let drv = driver();
        let original = drv.create(0, KIB_64, 0).unwrap();
        original.copy_from_host(0, b"can you see me?").unwrap();

        let imported = drv.import(0, original.export().unwrap(), KIB_64).unwrap();
        assert_ne!(imported.address(), original.address());

        let mut buf = [0u8; 15];
        imported.copy_to_host(0, &mut buf).unwrap();
        assert_eq!(&buf, b"can you see me?");

        imported.copy_from_host(100, &[7, 8, 9]).unwrap();
        let mut back = [0u8; 3];
        original.copy_to_host(100, &mut back).unwrap();
        assert_eq!(back, [7, 8, 9]);
    }

    #[test]
    fn test_import_larger_than_handle_fails() {
        let drv = driver();
        let original = drv.create(0, KIB_64, 0).unwrap();
        let result = drv.import(0, original.export().unwrap(), 2 * KIB_64);
        assert!(result.is_err());
    }

    #[test]
    fn test_pages_outlive_exporter() {
        let drv = driver();
        let original = drv.create(0, KIB_64, 0).unwrap();
        original.copy_from_host(0, b"persist").unwrap();
        let fd = original.export().unwrap();
        drop(original);

        let imported = drv.import(0, fd, KIB_64).unwrap();
        let mut buf = [0u8; 7];
        imported.copy_to_host(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persist");
    }
}
