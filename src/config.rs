//! Broker configuration.

use crate::device::HostDeviceConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`BrokerConfig::runtime_dir`].
pub const ENV_RUNTIME_DIR: &str = "MEMMAP_BROKER_DIR";
/// Environment variable overriding [`BrokerConfig::request_timeout`], in
/// milliseconds. `0` disables the timeout.
pub const ENV_TIMEOUT_MS: &str = "MEMMAP_BROKER_TIMEOUT_MS";
/// Environment variable overriding the device count.
pub const ENV_DEVICES: &str = "MEMMAP_BROKER_DEVICES";
/// Environment variable overriding the allocation granularity in bytes.
pub const ENV_GRANULARITY: &str = "MEMMAP_BROKER_GRANULARITY";

const SERVER_ENDPOINT: &str = "broker.sock";
const LOCK_FILE: &str = "broker.lock";

/// Configuration shared by the server and its clients.
///
/// Every participant must agree on `runtime_dir`; it holds the well-known
/// server endpoint, the election lock and the client endpoints.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory holding the broker's socket and lock files.
    pub runtime_dir: PathBuf,
    /// How long a client waits for a response. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Device set served by the host driver.
    pub device: HostDeviceConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            runtime_dir: base.join("memmap-broker"),
            request_timeout: Some(Duration::from_secs(5)),
            device: HostDeviceConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_RUNTIME_DIR) {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_number::<u64>(ENV_TIMEOUT_MS)? {
            config.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(count) = env_number::<u32>(ENV_DEVICES)? {
            config.device.device_count = count;
        }
        if let Some(granularity) = env_number::<usize>(ENV_GRANULARITY)? {
            config.device.granularity = granularity;
        }
        Ok(config)
    }

    /// Set the runtime directory.
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the device configuration.
    pub fn with_device(mut self, device: HostDeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Path of the well-known server endpoint.
    pub fn server_endpoint(&self) -> PathBuf {
        self.runtime_dir.join(SERVER_ENDPOINT)
    }

    /// Path of the election lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join(LOCK_FILE)
    }

    /// Path of the endpoint for a client endpoint name.
    pub fn client_endpoint(&self, endpoint_name: &str) -> PathBuf {
        self.runtime_dir.join(endpoint_name)
    }

    /// Create the runtime directory if needed.
    pub fn ensure_runtime_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.runtime_dir)?;
        Ok(&self.runtime_dir)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidArgument(format!("{key}={value:?}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::InvalidArgument(format!("{key}: {e}"))),
    }
}
