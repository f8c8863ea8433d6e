//! Per-device live MJPEG streaming

pub mod live;

pub use live::LiveStreamServer;
