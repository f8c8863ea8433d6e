//! Control endpoint
//!
//! The control port lists devices, starts and stops recordings and
//! broadcasts, manages saved videos and serves playback. [`ControlServer`]
//! also owns the periodic device scan and the optional SSDP listener, so
//! starting it brings the whole streamer up.
//!
//! # Example
//!
//! ```no_run
//! use vstreamer::config::StreamerConfig;
//! use vstreamer::control::ControlServer;
//!
//! # async fn example() -> vstreamer::error::Result<()> {
//! let config = StreamerConfig::default().input_stream("Drone;rtsp://192.168.1.1/live");
//! let server = ControlServer::start(&config).await?;
//! tokio::signal::ctrl_c().await?;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod dto;
pub mod request;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capture::FfmpegCapture;
use crate::config::{Parameters, StreamerConfig};
use crate::discovery::ssdp::SsdpListener;
use crate::discovery::StreamList;
use crate::error::Result;
use crate::registry::DeviceRegistry;
use crate::server::{ConnectionServer, ServerStopper};
use crate::storage::VideoStore;

pub use dispatcher::ControlHandler;
pub use request::Route;

/// Running streamer: control port, device scan and discovery
pub struct ControlServer {
    registry: Arc<DeviceRegistry>,
    port: u16,
    stopper: ServerStopper,
    shutdown: watch::Sender<bool>,
    server: parking_lot::Mutex<Option<JoinHandle<()>>>,
    scanner: parking_lot::Mutex<Option<JoinHandle<()>>>,
    ssdp: parking_lot::Mutex<Option<SsdpListener>>,
}

impl ControlServer {
    /// Start with the production capture backends and camera enumerator
    pub async fn start(config: &StreamerConfig) -> Result<Self> {
        config.validate()?;
        let params = Arc::new(Parameters::from(config));
        let streams = Arc::new(StreamList::from_entries(&config.input_streams));
        let registry = Arc::new(DeviceRegistry::from_config(config, params, streams));
        Self::with_registry(config, registry).await
    }

    /// Start around an existing registry. Binding the control port is the
    /// only fatal step; a failed SSDP setup is logged and skipped.
    pub async fn with_registry(config: &StreamerConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        let ffmpeg = match FfmpegCapture::locate(config.ffmpeg_path.clone()) {
            Ok(ffmpeg) => Some(ffmpeg.binary().to_path_buf()),
            Err(e) => {
                tracing::warn!(error = %e, "ffmpeg not available, broadcasts disabled");
                None
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server_config = config.control_server();
        let handler = ControlHandler::new(
            Arc::clone(&registry),
            VideoStore::new(config.saved_video_folder.clone()),
            ffmpeg,
            shutdown_rx.clone(),
            server_config.read_timeout,
            server_config.max_line_length,
        );
        let server = ConnectionServer::bind(server_config, handler).await?;
        let port = server.local_port();
        let stopper = server.stopper();
        let server = tokio::spawn(server.run());

        registry.scan().await;
        let scanner = registry.spawn_scan_task(shutdown_rx);

        let ssdp = if config.discovery.enabled {
            match SsdpListener::spawn(config.discovery.clone(), Arc::clone(registry.streams())).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    tracing::warn!(error = %e, "SSDP discovery unavailable");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            port = port,
            video_folder = %config.saved_video_folder.display(),
            "Control server started"
        );

        Ok(Self {
            registry,
            port,
            stopper,
            shutdown,
            server: parking_lot::Mutex::new(Some(server)),
            scanner: parking_lot::Mutex::new(Some(scanner)),
            ssdp: parking_lot::Mutex::new(ssdp),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Stop accepting, stop scanning and discovery, then stop every live
    /// stream. Idempotent.
    pub async fn stop(&self) {
        self.stopper.stop();
        self.shutdown.send_replace(true);

        let scanner = self.scanner.lock().take();
        if let Some(task) = scanner {
            let _ = task.await;
        }
        let ssdp = self.ssdp.lock().take();
        if let Some(listener) = ssdp {
            listener.stop().await;
        }
        self.registry.stop_all().await;

        let server = self.server.lock().take();
        if let Some(task) = server {
            let _ = task.await;
        }
        tracing::info!(port = self.port, "Control server stopped");
    }
}
