//! Server-side registry of subscribers and memory regions.
//!
//! The registry is owned by the serve loop and never shared; all mutation
//! goes through dispatch, so no locking is involved.
//!
//! Regions are stored by [`ShareableHandle`]. Named regions are additionally
//! indexed by [`MemName`], and each entry carries its name, so the
//! name → handle and handle → name lookups stay a bijection over named
//! regions. Anonymous regions are reachable by handle only.
//!
//! Handle ids are assigned from a counter and never reused, so a handle kept
//! past DEALLOCATE cannot reach a region allocated later.

use crate::device::DeviceAllocation;
use crate::identity::ProcessIdentity;
use crate::protocol::{DeviceAddress, MemName, ShareableHandle};
use std::collections::{HashMap, HashSet};

/// Registry failure, translated into a wire status by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The identity or name is already present.
    Duplicate,
    /// No matching entry.
    NotFound,
}

/// Result of a registry operation.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// A physically backed region as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Server-side handle identifier.
    pub handle: ShareableHandle,
    /// Base address of the server's mapping.
    pub base: DeviceAddress,
    /// Size in bytes, a multiple of the device granularity.
    pub size: usize,
}

/// One registered region.
#[derive(Debug)]
pub struct RegionEntry {
    /// Handle, base and size.
    pub region: MemoryRegion,
    /// Name, if allocated by name.
    pub name: Option<MemName>,
    /// Process that allocated the region.
    pub owner: ProcessIdentity,
    /// Pids that imported the region.
    pub importers: HashSet<u32>,
    allocation: DeviceAllocation,
}

impl RegionEntry {
    /// The server's allocation backing this region.
    pub fn allocation(&self) -> &DeviceAllocation {
        &self.allocation
    }
}

/// Subscribers and regions known to the server.
#[derive(Debug, Default)]
pub struct Registry {
    subscribers: HashMap<u32, ProcessIdentity>,
    regions: HashMap<ShareableHandle, RegionEntry>,
    names: HashMap<MemName, ShareableHandle>,
    next_handle: u64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity to the subscriber set.
    ///
    /// A pid that is already present is left untouched and reported as
    /// [`RegistryError::Duplicate`].
    pub fn register(&mut self, identity: ProcessIdentity) -> RegistryResult<()> {
        if self.subscribers.contains_key(&identity.pid) {
            return Err(RegistryError::Duplicate);
        }
        self.subscribers.insert(identity.pid, identity);
        Ok(())
    }

    /// Remove an identity from the subscriber set.
    pub fn deregister(&mut self, pid: u32) -> RegistryResult<ProcessIdentity> {
        self.subscribers.remove(&pid).ok_or(RegistryError::NotFound)
    }

    /// Whether `pid` is registered.
    pub fn is_registered(&self, pid: u32) -> bool {
        self.subscribers.contains_key(&pid)
    }

    /// The registered identity for `pid`.
    pub fn subscriber(&self, pid: u32) -> Option<&ProcessIdentity> {
        self.subscribers.get(&pid)
    }

    /// Number of registered identities.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether a region is registered under `name`.
    pub fn contains_name(&self, name: &MemName) -> bool {
        self.names.contains_key(name)
    }

    /// Record a new region under a fresh handle id.
    pub fn insert_region(
        &mut self,
        name: Option<MemName>,
        owner: ProcessIdentity,
        allocation: DeviceAllocation,
    ) -> RegistryResult<&RegionEntry> {
        if let Some(name) = &name {
            if self.names.contains_key(name) {
                return Err(RegistryError::Duplicate);
            }
        }
        self.next_handle += 1;
        let handle = ShareableHandle(self.next_handle);

        if let Some(name) = &name {
            self.names.insert(name.clone(), handle);
        }
        let entry = RegionEntry {
            region: MemoryRegion {
                handle,
                base: allocation.address(),
                size: allocation.len(),
            },
            name,
            owner,
            importers: HashSet::new(),
            allocation,
        };
        Ok(self.regions.entry(handle).or_insert(entry))
    }

    /// Look up a region by name.
    pub fn lookup_name(&self, name: &MemName) -> Option<&RegionEntry> {
        self.names.get(name).and_then(|h| self.regions.get(h))
    }

    /// Look up a region by handle.
    pub fn lookup_handle(&self, handle: ShareableHandle) -> Option<&RegionEntry> {
        self.regions.get(&handle)
    }

    /// Name bound to `handle`, if any.
    pub fn name_of(&self, handle: ShareableHandle) -> Option<&MemName> {
        self.regions.get(&handle).and_then(|e| e.name.as_ref())
    }

    /// Resolve a request's operands to a handle: by name when given,
    /// otherwise by handle.
    pub fn resolve(
        &self,
        name: Option<&MemName>,
        handle: Option<ShareableHandle>,
    ) -> RegistryResult<ShareableHandle> {
        let found = match (name, handle) {
            (Some(name), _) => self.names.get(name).copied(),
            (None, Some(handle)) => self.regions.contains_key(&handle).then_some(handle),
            (None, None) => None,
        };
        found.ok_or(RegistryError::NotFound)
    }

    /// Note that `pid` imported the region.
    pub fn record_importer(&mut self, handle: ShareableHandle, pid: u32) -> RegistryResult<()> {
        let entry = self
            .regions
            .get_mut(&handle)
            .ok_or(RegistryError::NotFound)?;
        entry.importers.insert(pid);
        Ok(())
    }

    /// Remove a region from both indexes and hand back its entry.
    ///
    /// Dropping the returned entry releases the server's mapping and handle.
    pub fn remove(&mut self, handle: ShareableHandle) -> RegistryResult<RegionEntry> {
        let entry = self
            .regions
            .remove(&handle)
            .ok_or(RegistryError::NotFound)?;
        if let Some(name) = &entry.name {
            self.names.remove(name);
        }
        Ok(entry)
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if no regions are registered.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total bytes held by registered regions.
    pub fn total_bytes(&self) -> usize {
        self.regions.values().map(|e| e.region.size).sum()
    }

    /// Iterate over all regions.
    pub fn regions(&self) -> impl Iterator<Item = &RegionEntry> {
        self.regions.values()
    }
}
