//! Live-stream server
//!
//! Every registered device gets its own listening port serving
//! `multipart/x-mixed-replace` MJPEG to any number of viewers. The server
//! also owns the device's capture loop task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capture::{now_ms, Codec};
use crate::error::{Error, Result};
use crate::registry::capture_loop::{self, CaptureExit};
use crate::registry::device::Device;
use crate::server::{
    response, Connection, ConnectionHandler, ConnectionServer, ServerConfig, ServerStopper,
};

/// Longest request head we read from a viewer before streaming
const MAX_HEADER_LINES: usize = 64;

/// MJPEG server and capture loop of one device
pub struct LiveStreamServer {
    device: Arc<Device>,
    stopper: ServerStopper,
    shutdown: watch::Sender<bool>,
    capture: parking_lot::Mutex<Option<JoinHandle<CaptureExit>>>,
    server: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LiveStreamServer {
    /// Bind the device's port and start serving.
    ///
    /// The capture loop starts idle; it opens the device once a consumer
    /// shows interest.
    pub async fn start(
        device: Arc<Device>,
        config: ServerConfig,
        max_capture_failures: u32,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = config.port(device.port());
        let handler = MjpegHandler {
            device: Arc::clone(&device),
            shutdown: shutdown_rx.clone(),
            read_timeout: config.read_timeout,
            max_line_length: config.max_line_length,
        };
        let server = ConnectionServer::bind(config, handler).await?;
        let stopper = server.stopper();
        let server = tokio::spawn(server.run());

        let capture = tokio::spawn(capture_loop::run(
            Arc::clone(&device),
            shutdown_rx,
            max_capture_failures,
        ));

        tracing::info!(
            device = %device.name(),
            port = device.port(),
            device_type = %device.device_type(),
            "Live stream started"
        );

        Ok(Self {
            device,
            stopper,
            shutdown,
            capture: parking_lot::Mutex::new(Some(capture)),
            server: parking_lot::Mutex::new(Some(server)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn port(&self) -> u16 {
        self.device.port()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// True when viewers are waiting but no frame arrived within the
    /// device's timeout
    pub fn is_timeout(&self) -> bool {
        let timeout = self.device.descriptor().timeout;
        if timeout.is_zero() || self.device.viewers() == 0 {
            return false;
        }
        let since = self.device.last_frame_ms().max(self.device.viewer_since_ms());
        let idle_ms = now_ms() - since;
        if idle_ms > timeout.as_millis() as i64 {
            tracing::debug!(device = %self.device.name(), idle_ms = idle_ms, "Live stream timed out");
            return true;
        }
        false
    }

    /// True once the capture loop gave up on the device
    pub fn capture_finished(&self) -> bool {
        self.capture
            .lock()
            .as_ref()
            .map_or(true, |task| task.is_finished())
    }

    /// Stop serving, end the device's sessions and wait for the capture
    /// loop to exit before releasing the device. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stopper.stop();
        self.device.stop_sessions().await;
        self.shutdown.send_replace(true);

        let capture = self.capture.lock().take();
        if let Some(task) = capture {
            if let Err(e) = task.await {
                tracing::warn!(device = %self.device.name(), error = %e, "Capture loop panicked");
            }
        }
        self.device.close().await;

        let server = self.server.lock().take();
        if let Some(task) = server {
            let _ = task.await;
        }
        tracing::info!(device = %self.device.name(), port = self.port(), "Live stream stopped");
    }
}

impl std::fmt::Debug for LiveStreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStreamServer")
            .field("device", &self.device)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct MjpegHandler {
    device: Arc<Device>,
    shutdown: watch::Receiver<bool>,
    read_timeout: std::time::Duration,
    max_line_length: usize,
}

impl MjpegHandler {
    /// Consume the request head. Viewers that send nothing still get the
    /// stream.
    async fn skip_request(&self, conn: &mut Connection) -> Result<()> {
        for _ in 0..MAX_HEADER_LINES {
            match conn.read_line(self.max_line_length, self.read_timeout).await {
                Ok(line) if line.is_empty() => return Ok(()),
                Ok(_) => {}
                Err(Error::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ConnectionHandler for MjpegHandler {
    async fn handle(&self, mut conn: Connection) -> Result<()> {
        self.skip_request(&mut conn).await?;

        let _viewer = self.device.add_viewer();
        let mut frames = self.device.subscribe(Codec::Mjpeg);
        let mut shutdown = self.shutdown.clone();
        let mut preamble_sent = false;

        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = stopped(&mut shutdown) => None,
            };
            let Some(frame) = frame else {
                break;
            };

            if !preamble_sent {
                conn.write_all(response::mjpeg_preamble().as_bytes()).await?;
                preamble_sent = true;
            }
            conn.write_all(&response::mjpeg_part(&frame.data, frame.timestamp_ms))
                .await?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        tracing::debug!(device = %self.device.name(), "Live stream listener closed");
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
