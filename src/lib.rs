//! vstreamer: video device streaming and recording server
//!
//! Captures frames from local cameras, network streams and recorded files,
//! fans them out to any number of consumers, and exposes:
//!
//! - a control port for device listing, recording, broadcasting, saved
//!   video management and playback ([`control`])
//! - one MJPEG live-stream port per device ([`stream`])
//!
//! # Architecture
//!
//! ```text
//!   DeviceEnumerator ─┐
//!   input streams ────┼──► DeviceRegistry ──► LiveStreamServer (per device)
//!   SSDP discovery ───┘         │                   │
//!                               │             capture loop ──► FrameSlot
//!   ControlServer ──────────────┘                                 │
//!                                     viewers, recording, broadcast ◄┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vstreamer::{ControlServer, StreamerConfig};
//!
//! #[tokio::main]
//! async fn main() -> vstreamer::Result<()> {
//!     let config = StreamerConfig::default().saved_video_folder("/var/lib/vstreamer");
//!     let server = ControlServer::start(&config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod media;
pub mod playback;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod stream;

pub use config::{Parameters, StreamerConfig};
pub use control::ControlServer;
pub use error::{Error, Result};
pub use registry::{Device, DeviceRegistry};
pub use stream::LiveStreamServer;
