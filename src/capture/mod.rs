//! Codec adapter layer
//!
//! A [`CaptureBackend`] knows how to probe and open one family of inputs;
//! an opened [`CaptureHandle`] produces encoded frames for a requested
//! [`CodecSet`]. Handle calls are blocking and are driven from the blocking
//! thread pool by the capture loop.
//!
//! Backends are tried in order by [`CaptureSelector`]; the first one whose
//! `check` succeeds is kept for the lifetime of the device.

pub mod ffmpeg;
pub mod file;
pub mod synthetic;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

pub use ffmpeg::FfmpegCapture;
pub use file::FileCapture;
pub use synthetic::SyntheticCapture;

/// Encoded frame kinds a consumer can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// One JPEG image per frame
    Mjpeg,
    /// One FLV video tag body per frame
    Flv,
}

impl Codec {
    fn bit(self) -> u8 {
        match self {
            Codec::Mjpeg => 0x01,
            Codec::Flv => 0x02,
        }
    }
}

/// Bitmask of requested codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecSet(u8);

impl CodecSet {
    pub const EMPTY: CodecSet = CodecSet(0);
    pub const MJPEG: CodecSet = CodecSet(0x01);
    pub const FLV: CodecSet = CodecSet(0x02);

    pub fn contains(self, codec: Codec) -> bool {
        self.0 & codec.bit() != 0
    }

    pub fn insert(&mut self, codec: Codec) {
        self.0 |= codec.bit();
    }

    pub fn with(mut self, codec: Codec) -> Self {
        self.insert(codec);
        self
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CodecSet {
    type Output = CodecSet;

    fn bitor(self, rhs: CodecSet) -> CodecSet {
        CodecSet(self.0 | rhs.0)
    }
}

/// One encoded frame
///
/// Cheap to clone: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub codec: Codec,
    pub data: Bytes,
    /// Capture time, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl Frame {
    pub fn new(codec: Codec, data: Bytes, timestamp_ms: i64) -> Self {
        Self {
            codec,
            data,
            timestamp_ms,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Wall clock in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Kind of capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeviceType {
    Camera = 0,
    Stream = 1,
    File = 2,
}

impl From<DeviceType> for u8 {
    fn from(t: DeviceType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for DeviceType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(DeviceType::Camera),
            1 => Ok(DeviceType::Stream),
            2 => Ok(DeviceType::File),
            other => Err(format!("unknown device type {}", other)),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Camera => write!(f, "camera"),
            DeviceType::Stream => write!(f, "stream"),
            DeviceType::File => write!(f, "file"),
        }
    }
}

/// Everything needed to open a capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Unique name; the registry key
    pub name: String,
    pub device_type: DeviceType,
    /// Camera device path, stream URL or file path
    pub url: String,
    /// Position among detected cameras
    pub index: u32,
    /// Requested geometry, 0 = source default
    pub width: u32,
    pub height: u32,
    /// Viewer inactivity timeout, zero disables it
    pub timeout: Duration,
}

impl DeviceDescriptor {
    pub fn camera(name: impl Into<String>, index: u32, timeout: Duration) -> Self {
        let name = name.into();
        Self {
            url: name.clone(),
            name,
            device_type: DeviceType::Camera,
            index,
            width: 0,
            height: 0,
            timeout,
        }
    }

    pub fn stream(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        let device_type = if is_file_url(&url) {
            DeviceType::File
        } else {
            DeviceType::Stream
        };
        Self {
            name: name.into(),
            device_type,
            url,
            index: 0,
            width: 0,
            height: 0,
            timeout,
        }
    }

    pub fn with_geometry(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Local filesystem path for FILE devices
    pub fn file_path(&self) -> PathBuf {
        PathBuf::from(self.url.strip_prefix("file://").unwrap_or(&self.url))
    }
}

fn is_file_url(url: &str) -> bool {
    url.starts_with("file://") || (!url.contains("://") && std::path::Path::new(url).is_file())
}

/// Factory for capture handles of one input family
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capability probe, cheap and side effect free
    fn check(&self, device: &DeviceDescriptor) -> bool;

    /// Open the device for capture
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// An opened capture source
pub trait CaptureHandle: Send {
    /// Block until the next frame is available and return it encoded in
    /// every requested codec the handle can produce.
    fn get_frame(&mut self, codecs: CodecSet) -> Result<Vec<Frame>, CaptureError>;

    /// Negotiated geometry, (0, 0) until known
    fn geometry(&self) -> (u32, u32);

    /// Release the source. Must be idempotent.
    fn close(&mut self);
}

/// Ordered capability probe over the available backends
#[derive(Clone)]
pub struct CaptureSelector {
    backends: Vec<Arc<dyn CaptureBackend>>,
}

impl CaptureSelector {
    pub fn new(backends: Vec<Arc<dyn CaptureBackend>>) -> Self {
        Self { backends }
    }

    /// The production backend set: recorded files, then ffmpeg, then the
    /// synthetic test pattern
    pub fn with_defaults(ffmpeg_path: Option<PathBuf>) -> Self {
        let mut backends: Vec<Arc<dyn CaptureBackend>> =
            vec![Arc::new(FileCapture::new(ffmpeg_path.clone()))];
        match FfmpegCapture::locate(ffmpeg_path) {
            Ok(ffmpeg) => backends.push(Arc::new(ffmpeg)),
            Err(e) => tracing::warn!(error = %e, "ffmpeg unavailable, cameras and streams disabled"),
        }
        backends.push(Arc::new(SyntheticCapture::new()));
        Self { backends }
    }

    /// First backend that accepts the device
    pub fn select(&self, device: &DeviceDescriptor) -> Option<Arc<dyn CaptureBackend>> {
        let backend = self.backends.iter().find(|b| b.check(device)).cloned();
        match &backend {
            Some(b) => tracing::debug!(device = %device.name, backend = b.name(), "Capture backend selected"),
            None => tracing::debug!(device = %device.name, "No capture backend accepts device"),
        }
        backend
    }
}

impl fmt::Debug for CaptureSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("CaptureSelector").field("backends", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_set() {
        let mut set = CodecSet::EMPTY;
        assert!(set.is_empty());

        set.insert(Codec::Mjpeg);
        assert!(set.contains(Codec::Mjpeg));
        assert!(!set.contains(Codec::Flv));

        let both = set | CodecSet::FLV;
        assert!(both.contains(Codec::Flv));
        assert_eq!(both, CodecSet::EMPTY.with(Codec::Flv).with(Codec::Mjpeg));
    }

    #[test]
    fn test_stream_descriptor_type() {
        let d = DeviceDescriptor::stream("drone", "rtsp://10.0.0.1/live", Duration::from_secs(60));
        assert_eq!(d.device_type, DeviceType::Stream);

        let d = DeviceDescriptor::stream("rec", "file:///tmp/a.flv", Duration::ZERO);
        assert_eq!(d.device_type, DeviceType::File);
        assert_eq!(d.file_path(), PathBuf::from("/tmp/a.flv"));
    }

    #[test]
    fn test_selector_picks_first_accepting_backend() {
        let selector = CaptureSelector::new(vec![
            Arc::new(FileCapture::new(None)),
            Arc::new(SyntheticCapture::new()),
        ]);

        let d = DeviceDescriptor::stream("test", "synthetic://test", Duration::ZERO);
        assert_eq!(selector.select(&d).unwrap().name(), "synthetic");

        let d = DeviceDescriptor::stream("x", "rtsp://nowhere", Duration::ZERO);
        assert!(selector.select(&d).is_none());
    }

    #[test]
    fn test_device_type_serializes_as_number() {
        assert_eq!(serde_json::to_string(&DeviceType::File).unwrap(), "2");
    }
}
