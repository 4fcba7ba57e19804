//! Server election and the process-wide broker handle.
//!
//! The first process to arrive becomes the server; everyone after it is a
//! client. The election runs under an exclusive `flock` on
//! `<runtime_dir>/broker.lock`, so exactly one contender at a time inspects
//! and possibly claims the well-known endpoint:
//!
//! ```text
//! flock(broker.lock)
//!   probe(broker.sock)
//!     Live   -> client
//!     Stale  -> unlink, then claim
//!     Absent -> claim: bind, init device, spawn serve loop
//! unlock
//! ```
//!
//! The endpoint is bound before the lock is released, so a later contender
//! always observes it as live.

use crate::client::Client;
use crate::config::BrokerConfig;
use crate::device::{DeviceDriver, HostDriver};
use crate::error::{Error, Result};
use crate::identity::ProcessIdentity;
use crate::ipc::{Probe, probe};
use crate::server::Server;
use rustix::fs::FlockOperation;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;

const SERVER_THREAD: &str = "memmap-broker-server";

/// Exclusive advisory lock on the election file, released on drop.
struct ElectionLock {
    file: File,
}

impl ElectionLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        rustix::fs::flock(&file, FlockOperation::LockExclusive)?;
        Ok(Self { file })
    }
}

impl Drop for ElectionLock {
    fn drop(&mut self) {
        if let Err(e) = rustix::fs::flock(&self.file, FlockOperation::Unlock) {
            tracing::warn!("failed to release election lock: {}", e);
        }
    }
}

/// Which side of the protocol this process plays.
#[derive(Debug)]
enum Role {
    Server(Mutex<Option<JoinHandle<Result<()>>>>),
    Client,
}

/// Outcome of the election for one process.
///
/// Regardless of role, the process talks to the server through a
/// [`Client`] obtained from [`Broker::connect`]; the elected process simply
/// also runs the serve loop on a background thread.
pub struct Broker {
    config: BrokerConfig,
    driver: Arc<dyn DeviceDriver>,
    role: Role,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("runtime_dir", &self.config.runtime_dir)
            .field("driver", &self.driver.name())
            .field("role", &self.role)
            .finish()
    }
}

impl Broker {
    /// The process-wide broker.
    ///
    /// The first call runs the election with `config`; later calls return
    /// the same broker and ignore their argument. A failed election is not
    /// cached, so a later call retries.
    pub fn instance(config: BrokerConfig) -> Result<&'static Broker> {
        static INSTANCE: OnceLock<Broker> = OnceLock::new();
        static INIT: Mutex<()> = Mutex::new(());

        if let Some(broker) = INSTANCE.get() {
            return Ok(broker);
        }
        let _init = INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(broker) = INSTANCE.get() {
            return Ok(broker);
        }
        let broker = Self::arbitrate(config)?;
        Ok(INSTANCE.get_or_init(|| broker))
    }

    /// Run the election with the host driver built from `config.device`.
    pub fn arbitrate(config: BrokerConfig) -> Result<Self> {
        let driver: Arc<dyn DeviceDriver> = Arc::new(HostDriver::new(config.device.clone())?);
        Self::arbitrate_with(config, driver)
    }

    /// Run the election with an explicit driver.
    pub fn arbitrate_with(config: BrokerConfig, driver: Arc<dyn DeviceDriver>) -> Result<Self> {
        config.ensure_runtime_dir()?;
        let _lock = ElectionLock::acquire(&config.lock_path())?;

        let endpoint = config.server_endpoint();
        match probe(&endpoint)? {
            Probe::Live => {
                tracing::info!(endpoint = %endpoint.display(), "server already running, joining as client");
                return Ok(Self {
                    config,
                    driver,
                    role: Role::Client,
                });
            }
            Probe::Stale => {
                tracing::warn!(endpoint = %endpoint.display(), "removing stale server endpoint");
                std::fs::remove_file(&endpoint)?;
            }
            Probe::Absent => {}
        }

        let server = Server::bind(config.clone(), Arc::clone(&driver))?;
        let handle = std::thread::Builder::new()
            .name(SERVER_THREAD.into())
            .spawn(move || server.serve())?;
        tracing::info!(endpoint = %endpoint.display(), "elected as server");

        Ok(Self {
            config,
            driver,
            role: Role::Server(Mutex::new(Some(handle))),
        })
    }

    /// Whether this process runs the serve loop.
    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Configuration the election ran with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The device driver shared by the server and this process's clients.
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Open a client endpoint for `identity`.
    pub fn connect(&self, identity: ProcessIdentity) -> Result<Client> {
        Client::connect(&self.config, identity, Arc::clone(&self.driver))
    }

    /// Block until the serve loop exits and return its result.
    ///
    /// Returns immediately for clients and on every call after the first.
    pub fn wait(&self) -> Result<()> {
        let Role::Server(handle) = &self.role else {
            return Ok(());
        };
        let handle = handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::ServerUnavailable("server thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceConfig;

    fn config(dir: &Path) -> BrokerConfig {
        BrokerConfig::default()
            .with_runtime_dir(dir)
            .with_device(HostDeviceConfig::default().with_granularity(64 * 1024))
    }

    #[test]
    fn test_first_arbiter_serves_second_joins() {
        let dir = tempfile::tempdir().unwrap();
        let server = Broker::arbitrate(config(dir.path())).unwrap();
        assert!(server.is_server());
        assert!(dir.path().join("broker.sock").exists());

        let client = Broker::arbitrate(config(dir.path())).unwrap();
        assert!(!client.is_server());
        client.wait().unwrap();

        let mut c = client.connect(ProcessIdentity::with_pid(900, 0)).unwrap();
        c.echo().unwrap();
        c.halt().unwrap();
        server.wait().unwrap();
        server.wait().unwrap();
        assert!(!dir.path().join("broker.sock").exists());
    }

    #[test]
    fn test_stale_endpoint_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        drop(std::os::unix::net::UnixDatagram::bind(config.server_endpoint()).unwrap());
        assert_eq!(probe(&config.server_endpoint()).unwrap(), Probe::Stale);

        let broker = Broker::arbitrate(config).unwrap();
        assert!(broker.is_server());
        let mut c = broker.connect(ProcessIdentity::with_pid(901, 0)).unwrap();
        c.halt().unwrap();
        broker.wait().unwrap();
    }

    #[test]
    fn test_invalid_device_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_device(HostDeviceConfig::default().with_device_count(0));
        assert!(Broker::arbitrate(config).is_err());
        assert!(!dir.path().join("broker.sock").exists());
    }
}
