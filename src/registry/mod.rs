//! Device registry and capture fan-out
//!
//! The registry maps device names to running live-stream servers. Each
//! [`Device`] owns one capture handle and publishes what it reads into
//! per-codec [`FrameSlot`]s, which any number of consumers watch.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<DeviceRegistry>
//!                   ┌───────────────────────────┐
//!                   │ servers: BTreeMap<Name,   │
//!                   │   LiveStreamServer {      │
//!                   │     device: Arc<Device>,  │
//!                   │     capture loop task,    │
//!                   │   }                       │
//!                   │ >                         │
//!                   └─────────────┬─────────────┘
//!                                 │
//!            capture_loop::run ──► device.publish()
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!    [MJPEG viewer]         [Recording]            [Broadcast]
//!    slot.subscribe()       slot.subscribe()       slot.subscribe()
//! ```
//!
//! # Latest-frame semantics
//!
//! A slot holds one frame. Slow consumers skip straight to the newest one;
//! nothing queues up behind them. Frame payloads are `bytes::Bytes`, so
//! every consumer shares the same allocation.

pub mod capture_loop;
pub mod device;
pub mod port;
pub mod slot;
pub mod store;

pub use capture_loop::CaptureExit;
pub use device::{BroadcastStatus, Device, RecordingStatus, ViewerGuard};
pub use port::PortAllocator;
pub use slot::{FrameReceiver, FrameSlot};
pub use store::DeviceRegistry;
