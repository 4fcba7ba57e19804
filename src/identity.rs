//! Participating-process identity.
//!
//! A [`ProcessIdentity`] names a process on the wire and in the registry. It
//! also determines where responses are routed: every process binds its own
//! endpoint whose name is derived from its pid.

use crate::device::DeviceContext;
use crate::error::{Error, Result};
use std::hash::{Hash, Hasher};

/// Driver-level handle of a device.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct DeviceHandle(pub i32);

/// Driver-level handle of a device execution context.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct ContextHandle(pub u64);

/// Identity of a process taking part in the broker protocol.
///
/// Two identities are equal when their pids are equal; the device fields are
/// descriptive only.
#[derive(Clone, Copy, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct ProcessIdentity {
    /// OS process id.
    pub pid: u32,
    /// Ordinal of the device this process is bound to.
    pub device_ordinal: u32,
    /// Driver handle of that device.
    pub device: DeviceHandle,
    /// Execution context, set once by [`ProcessIdentity::bind_context`].
    pub context: Option<ContextHandle>,
}

impl ProcessIdentity {
    /// Identity of the calling process on the given device.
    pub fn current(device_ordinal: u32) -> Self {
        Self::with_pid(std::process::id(), device_ordinal)
    }

    /// Identity with an explicit pid.
    ///
    /// Used by harnesses that run several logical clients inside one OS
    /// process; each needs its own endpoint and registry key.
    pub fn with_pid(pid: u32, device_ordinal: u32) -> Self {
        Self {
            pid,
            device_ordinal,
            device: DeviceHandle(device_ordinal as i32),
            context: None,
        }
    }

    /// Bind the device execution context. Allowed exactly once.
    pub fn bind_context(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.context.is_some() {
            return Err(Error::ContextAlreadyBound(self.pid));
        }
        self.device = ctx.device;
        self.device_ordinal = ctx.ordinal;
        self.context = Some(ctx.handle);
        Ok(())
    }

    /// Whether a context has been bound.
    pub fn is_bound(&self) -> bool {
        self.context.is_some()
    }

    /// Name of this process's endpoint inside the runtime directory.
    pub fn endpoint_name(&self) -> String {
        format!("pid_{}.sock", self.pid)
    }
}

impl PartialEq for ProcessIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

impl Eq for ProcessIdentity {}

impl Hash for ProcessIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pid.hash(state);
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} (device {})", self.pid, self.device_ordinal)
    }
}
