//! Process configuration
//!
//! [`StreamerConfig`] is read once from a TOML file at startup and passed
//! down explicitly. The few values the control port can change at runtime
//! live in [`Parameters`].

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::server::ServerConfig;

/// Default control port
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Control port; live-stream ports are allocated above it
    pub server_port: u16,

    /// Addresses every server binds
    pub bind_addresses: Vec<IpAddr>,

    /// Concurrent connections per listening server (0 = unlimited)
    pub max_connections: usize,

    /// Detect local cameras
    pub autodetect: bool,

    /// Viewer inactivity timeout for cameras
    pub device_timeout_secs: u64,

    pub saved_video_folder: PathBuf,

    /// `Name;URL;Timeout;Width;Height` entries
    pub input_streams: Vec<String>,

    /// Cameras added even when autodetection is off
    pub allowed_devices: Vec<String>,

    /// Cameras never registered
    pub excluded_devices: Vec<String>,

    pub scan_interval_ms: u64,

    /// Consecutive capture failures before a device is given up
    pub max_capture_failures: u32,

    /// Explicit ffmpeg binary; searched on PATH otherwise
    pub ffmpeg_path: Option<PathBuf>,

    pub discovery: DiscoveryConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_PORT,
            bind_addresses: vec![
                IpAddr::from([0, 0, 0, 0]),
                IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]),
            ],
            max_connections: 0,
            autodetect: true,
            device_timeout_secs: 60,
            saved_video_folder: PathBuf::from("./videos"),
            input_streams: Vec::new(),
            allowed_devices: Vec::new(),
            excluded_devices: Vec::new(),
            scan_interval_ms: 1000,
            max_capture_failures: 10,
            ffmpeg_path: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl StreamerConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: StreamerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addresses.is_empty() {
            return Err(Error::Config("bind_addresses is empty".into()));
        }
        if self.scan_interval_ms == 0 {
            return Err(Error::Config("scan_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Set the control port
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Set the addresses every server binds
    pub fn bind_addresses(mut self, addrs: Vec<IpAddr>) -> Self {
        self.bind_addresses = addrs;
        self
    }

    /// Set the recordings folder
    pub fn saved_video_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.saved_video_folder = folder.into();
        self
    }

    /// Set camera autodetection
    pub fn autodetect(mut self, enabled: bool) -> Self {
        self.autodetect = enabled;
        self
    }

    /// Add an input stream entry
    pub fn input_stream(mut self, entry: impl Into<String>) -> Self {
        self.input_streams.push(entry.into());
        self
    }

    /// Set the device scan interval
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn scan_interval_duration(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    /// Listener settings for the control port
    pub fn control_server(&self) -> ServerConfig {
        self.live_server().port(self.server_port)
    }

    /// Listener template for live-stream ports; the port is set per device
    pub fn live_server(&self) -> ServerConfig {
        ServerConfig::default()
            .bind(self.bind_addresses.clone())
            .max_connections(self.max_connections)
    }
}

/// SSDP discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Service type searched for and accepted from notifications
    pub service_type: String,
    /// Viewer timeout given to discovered streams
    pub stream_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_type: "ugcs:video-source".to_string(),
            stream_timeout_secs: 60,
        }
    }
}

/// Runtime-mutable parameters, read and written through the control port
#[derive(Debug)]
pub struct Parameters {
    inner: RwLock<ParameterValues>,
}

/// Wire shape of [`Parameters`]; absent fields read as false
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterValues {
    pub autodetect: bool,
}

impl Parameters {
    pub fn new(autodetect: bool) -> Self {
        Self {
            inner: RwLock::new(ParameterValues { autodetect }),
        }
    }

    pub fn get(&self) -> ParameterValues {
        *self.inner.read()
    }

    pub fn autodetect(&self) -> bool {
        self.inner.read().autodetect
    }

    pub fn set(&self, values: ParameterValues) {
        *self.inner.write() = values;
        tracing::info!(autodetect = values.autodetect, "Parameters updated");
    }

    pub fn set_autodetect(&self, enabled: bool) {
        self.inner.write().autodetect = enabled;
        tracing::info!(autodetect = enabled, "Parameters updated");
    }
}

impl From<&StreamerConfig> for Parameters {
    fn from(config: &StreamerConfig) -> Self {
        Self::new(config.autodetect)
    }
}
