//! Device discovery
//!
//! Cameras come from a [`DeviceEnumerator`]; network streams come from the
//! configured input stream entries and, optionally, from SSDP
//! announcements. The registry merges both on every scan.

pub mod ssdp;

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::RwLock;

use crate::capture::DeviceDescriptor;

/// Timeout given to streams whose entry has none
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// OS specific camera listing
pub trait DeviceEnumerator: Send + Sync {
    /// Camera names, in a stable order
    fn list(&self) -> Vec<String>;
}

/// Lists `/dev/videoN` from the video4linux sysfs class
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    class_dir: PathBuf,
    dev_dir: PathBuf,
}

impl SysfsEnumerator {
    pub fn new() -> Self {
        Self::with_paths("/sys/class/video4linux", "/dev")
    }

    pub fn with_paths(class_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            class_dir: class_dir.into(),
            dev_dir: dev_dir.into(),
        }
    }
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn list(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.class_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.class_dir.display(), error = %e, "Cannot list video devices");
                return Vec::new();
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("video"))
            .map(|name| self.dev_dir.join(name).to_string_lossy().into_owned())
            .collect();
        names.sort_by_key(|name| video_number(name));
        names
    }
}

/// Numeric suffix of `/dev/videoN`, for natural ordering
fn video_number(name: &str) -> (u32, String) {
    let digits = name.trim_start_matches(|c: char| !c.is_ascii_digit());
    (digits.parse().unwrap_or(u32::MAX), name.to_string())
}

/// Fixed camera list, for platforms without autodetection and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticEnumerator {
    names: Vec<String>,
}

impl StaticEnumerator {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn list(&self) -> Vec<String> {
        self.names.clone()
    }
}

/// The platform's camera enumerator
pub fn platform_enumerator() -> Box<dyn DeviceEnumerator> {
    if cfg!(target_os = "linux") {
        Box::new(SysfsEnumerator::new())
    } else {
        Box::new(StaticEnumerator::default())
    }
}

/// Camera filter applied on every scan
#[derive(Debug, Clone, Default)]
pub struct CameraFilter {
    pub allowed: Vec<String>,
    pub excluded: Vec<String>,
    pub timeout: Duration,
}

impl CameraFilter {
    /// Autodetected names (when enabled) plus allowed names, minus excluded
    /// ones. The index is the position in the resulting list.
    pub fn cameras(&self, detected: Vec<String>, autodetect: bool) -> Vec<DeviceDescriptor> {
        let mut names = if autodetect { detected } else { Vec::new() };
        for name in &self.allowed {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.retain(|name| !self.excluded.contains(name));
        names
            .into_iter()
            .enumerate()
            .map(|(index, name)| DeviceDescriptor::camera(name, index as u32, self.timeout))
            .collect()
    }
}

/// Parse a `Name;URL;Timeout;Width;Height` entry. Only name and URL are
/// required; a non-numeric timeout means 60 s and non-numeric geometry 0.
pub fn parse_input_stream(entry: &str) -> Option<DeviceDescriptor> {
    let mut fields = entry.split(';');
    let name = fields.next()?.trim();
    let url = fields.next()?.trim();
    if name.is_empty() || url.is_empty() {
        return None;
    }

    let timeout = match fields.next().map(str::trim) {
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or_else(|_| {
                tracing::info!(stream = %name, "Stream timeout not numeric, using 60 s");
                DEFAULT_STREAM_TIMEOUT
            }),
        None => Duration::ZERO,
    };
    let width = fields.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0);
    let height = fields.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0);

    Some(DeviceDescriptor::stream(name, url, timeout).with_geometry(width, height))
}

/// Configured and discovered input streams
#[derive(Debug, Default)]
pub struct StreamList {
    entries: RwLock<Vec<DeviceDescriptor>>,
}

impl StreamList {
    /// Parse configured entries; malformed ones are logged and skipped
    pub fn from_entries(entries: &[String]) -> Self {
        let parsed = entries
            .iter()
            .filter_map(|entry| {
                let parsed = parse_input_stream(entry);
                match &parsed {
                    Some(d) => tracing::info!(
                        stream = %d.name,
                        url = %d.url,
                        timeout_secs = d.timeout.as_secs(),
                        "Input stream configured"
                    ),
                    None => tracing::warn!(entry = %entry, "Ignoring malformed input stream"),
                }
                parsed
            })
            .collect();
        Self {
            entries: RwLock::new(parsed),
        }
    }

    /// Add a stream, replacing any entry with the same name
    pub fn upsert(&self, descriptor: DeviceDescriptor) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|d| d.name == descriptor.name) {
            Some(existing) => *existing = descriptor,
            None => entries.push(descriptor),
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DeviceType;

    #[test]
    fn test_parse_full_entry() {
        let d = parse_input_stream("Drone;rtsp://192.168.1.1/live;30;640;480").unwrap();
        assert_eq!(d.name, "Drone");
        assert_eq!(d.url, "rtsp://192.168.1.1/live");
        assert_eq!(d.device_type, DeviceType::Stream);
        assert_eq!(d.timeout, Duration::from_secs(30));
        assert_eq!((d.width, d.height), (640, 480));
    }

    #[test]
    fn test_parse_lenient_fields() {
        let d = parse_input_stream("Cam;http://x/video;soon;wide").unwrap();
        assert_eq!(d.timeout, DEFAULT_STREAM_TIMEOUT);
        assert_eq!((d.width, d.height), (0, 0));

        let d = parse_input_stream("Cam;http://x/video").unwrap();
        assert_eq!(d.timeout, Duration::ZERO);

        assert!(parse_input_stream("only-a-name").is_none());
        assert!(parse_input_stream(";rtsp://x").is_none());
    }

    #[test]
    fn test_camera_filter() {
        let filter = CameraFilter {
            allowed: vec!["/dev/video9".into()],
            excluded: vec!["/dev/video1".into()],
            timeout: Duration::from_secs(60),
        };
        let detected = vec!["/dev/video0".to_string(), "/dev/video1".to_string()];

        let cameras = filter.cameras(detected.clone(), true);
        let names: Vec<_> = cameras.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["/dev/video0", "/dev/video9"]);
        assert_eq!(cameras[1].index, 1);
        assert_eq!(cameras[1].device_type, DeviceType::Camera);

        let cameras = filter.cameras(detected, false);
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].name, "/dev/video9");
        assert_eq!(cameras[0].index, 0);
    }

    #[test]
    fn test_sysfs_enumerator() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["video10", "video2", "vbi0", "video0"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let enumerator = SysfsEnumerator::with_paths(dir.path(), "/dev");
        assert_eq!(
            enumerator.list(),
            vec!["/dev/video0", "/dev/video2", "/dev/video10"]
        );

        let missing = SysfsEnumerator::with_paths(dir.path().join("nope"), "/dev");
        assert!(missing.list().is_empty());
    }

    #[test]
    fn test_stream_list_upsert() {
        let streams = StreamList::from_entries(&["A;rtsp://a".to_string(), "broken".to_string()]);
        assert_eq!(streams.len(), 1);

        streams.upsert(DeviceDescriptor::stream("A", "rtsp://a2", DEFAULT_STREAM_TIMEOUT));
        streams.upsert(DeviceDescriptor::stream("B", "rtsp://b", DEFAULT_STREAM_TIMEOUT));

        let snapshot = streams.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].url, "rtsp://a2");
    }
}
