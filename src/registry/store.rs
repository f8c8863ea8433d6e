//! Device registry implementation
//!
//! The authoritative `name -> live-stream server` map. A periodic scan
//! merges enumerated cameras with the input stream list, starts a live
//! stream for every new capturable device and retires devices that timed
//! out, vanished, or whose capture loop gave up.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};

use super::device::Device;
use super::port::PortAllocator;
use crate::capture::{CaptureBackend, CaptureSelector, DeviceDescriptor};
use crate::config::{Parameters, StreamerConfig};
use crate::discovery::{self, CameraFilter, DeviceEnumerator, StreamList};
use crate::server::ServerConfig;
use crate::stream::LiveStreamServer;

struct RegistryInner {
    servers: BTreeMap<String, Arc<LiveStreamServer>>,
    ports: PortAllocator,
}

/// Central registry of live devices
///
/// Every insert, removal and lookup goes through one `RwLock`; the devices
/// themselves synchronize their own state.
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
    scan_lock: Mutex<()>,
    selector: CaptureSelector,
    enumerator: Box<dyn DeviceEnumerator>,
    cameras: CameraFilter,
    streams: Arc<StreamList>,
    params: Arc<Parameters>,
    live_config: ServerConfig,
    max_capture_failures: u32,
    scan_interval: Duration,
}

impl DeviceRegistry {
    /// Registry with the production capture backends and the platform
    /// camera enumerator
    pub fn from_config(
        config: &StreamerConfig,
        params: Arc<Parameters>,
        streams: Arc<StreamList>,
    ) -> Self {
        Self::new(
            config,
            CaptureSelector::with_defaults(config.ffmpeg_path.clone()),
            discovery::platform_enumerator(),
            params,
            streams,
        )
    }

    pub fn new(
        config: &StreamerConfig,
        selector: CaptureSelector,
        enumerator: Box<dyn DeviceEnumerator>,
        params: Arc<Parameters>,
        streams: Arc<StreamList>,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                servers: BTreeMap::new(),
                ports: PortAllocator::new(config.server_port),
            }),
            scan_lock: Mutex::new(()),
            selector,
            enumerator,
            cameras: CameraFilter {
                allowed: config.allowed_devices.clone(),
                excluded: config.excluded_devices.clone(),
                timeout: config.device_timeout(),
            },
            streams,
            params,
            live_config: config.live_server(),
            max_capture_failures: config.max_capture_failures,
            scan_interval: config.scan_interval_duration(),
        }
    }

    pub fn streams(&self) -> &Arc<StreamList> {
        &self.streams
    }

    pub fn params(&self) -> &Arc<Parameters> {
        &self.params
    }

    /// Devices the current scan should have registered
    fn discover(&self) -> Vec<DeviceDescriptor> {
        let autodetect = self.params.autodetect();
        let detected = if autodetect {
            self.enumerator.list()
        } else {
            Vec::new()
        };
        let mut found = self.cameras.cameras(detected, autodetect);
        found.extend(self.streams.snapshot());
        found
    }

    /// One scan pass: retire stale devices, then register new ones.
    /// Concurrent calls run one after the other.
    pub async fn scan(&self) {
        let _scan = self.scan_lock.lock().await;
        let found = self.discover();
        let found_names: HashSet<&str> = found.iter().map(|d| d.name.as_str()).collect();

        let stale: Vec<Arc<LiveStreamServer>> = {
            let mut inner = self.inner.write().await;
            let names: Vec<String> = inner
                .servers
                .iter()
                .filter(|(name, server)| {
                    server.is_timeout()
                        || server.capture_finished()
                        || !found_names.contains(name.as_str())
                })
                .map(|(name, _)| name.clone())
                .collect();
            names
                .iter()
                .filter_map(|name| inner.servers.remove(name))
                .collect()
        };
        for server in stale {
            tracing::info!(device = %server.device().name(), port = server.port(), "Device removed");
            server.stop().await;
        }

        // Ports are reserved under the lock; binding happens outside it so
        // lookups from control requests are not held up
        let planned: Vec<(DeviceDescriptor, Arc<dyn CaptureBackend>, u16)> = {
            let mut inner = self.inner.write().await;
            let mut in_use: HashSet<u16> = inner.servers.values().map(|s| s.port()).collect();
            let mut names = HashSet::new();
            let mut planned = Vec::new();
            for descriptor in found {
                if inner.servers.contains_key(&descriptor.name) || names.contains(&descriptor.name) {
                    continue;
                }
                let Some(backend) = self.selector.select(&descriptor) else {
                    continue;
                };
                let Some(port) = inner.ports.next(&in_use) else {
                    tracing::error!(device = %descriptor.name, "No free port for live stream");
                    continue;
                };
                in_use.insert(port);
                names.insert(descriptor.name.clone());
                planned.push((descriptor, backend, port));
            }
            planned
        };

        let mut started = Vec::with_capacity(planned.len());
        for (descriptor, backend, port) in planned {
            let name = descriptor.name.clone();
            let device = Arc::new(Device::new(descriptor, port, backend));
            match LiveStreamServer::start(device, self.live_config.clone(), self.max_capture_failures)
                .await
            {
                Ok(server) => started.push((name, Arc::new(server))),
                Err(e) => {
                    tracing::warn!(device = %name, port = port, error = %e, "Cannot start live stream");
                }
            }
        }

        if !started.is_empty() {
            let mut inner = self.inner.write().await;
            for (name, server) in started {
                tracing::info!(device = %name, port = server.port(), "Device registered");
                inner.servers.insert(name, server);
            }
        }
    }

    /// Spawn the periodic scan task; it exits when `stop` turns true
    pub fn spawn_scan_task(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.scan_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.scan().await,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Device scan stopped");
        })
    }

    /// Registered devices, ordered by name
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        let inner = self.inner.read().await;
        inner
            .servers
            .values()
            .map(|s| Arc::clone(s.device()))
            .collect()
    }

    pub async fn find_by_port(&self, port: u16) -> Option<Arc<Device>> {
        let inner = self.inner.read().await;
        inner
            .servers
            .values()
            .find(|s| s.port() == port)
            .map(|s| Arc::clone(s.device()))
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Arc<Device>> {
        let inner = self.inner.read().await;
        inner.servers.get(name).map(|s| Arc::clone(s.device()))
    }

    /// True while any device is recording `video_id`
    pub async fn is_recording(&self, video_id: &str) -> bool {
        for device in self.devices().await {
            if device.is_recording(video_id).await {
                return true;
            }
        }
        false
    }

    pub async fn device_count(&self) -> usize {
        self.inner.read().await.servers.len()
    }

    /// Stop and remove every device
    pub async fn stop_all(&self) {
        let servers: Vec<_> = {
            let mut inner = self.inner.write().await;
            std::mem::take(&mut inner.servers).into_values().collect()
        };
        for server in servers {
            server.stop().await;
        }
        tracing::info!("All live streams stopped");
    }
}
