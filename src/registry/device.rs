//! Registered capture device
//!
//! A [`Device`] owns the opened capture handle, one [`FrameSlot`] per codec,
//! the consumer-interest counters the capture loop reads, and the recording
//! and broadcast sessions fed from its slots.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::slot::{FrameReceiver, FrameSlot};
use crate::capture::{
    now_ms, CaptureBackend, CaptureHandle, Codec, CodecSet, DeviceDescriptor, DeviceType, Frame,
};
use crate::error::CaptureError;
use crate::session::state::SessionState;
use crate::session::{
    BroadcastErrorCode, BroadcastSet, OuterStreamKind, RecordingErrorCode, RecordingSession,
};
use crate::storage::VideoStore;

/// Recording bookkeeping of one device
#[derive(Debug, Default)]
struct RecordingSlot {
    session: Option<RecordingSession>,
    video_id: String,
    last_duration_ms: i64,
    last_error: Option<RecordingErrorCode>,
}

/// Point-in-time recording status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingStatus {
    pub active: bool,
    pub video_id: String,
    pub duration_ms: i64,
    pub last_error: Option<RecordingErrorCode>,
}

/// Point-in-time status of one broadcast destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStatus {
    pub kind: OuterStreamKind,
    pub url: String,
    pub state: SessionState,
    pub error: BroadcastErrorCode,
}

pub struct Device {
    descriptor: DeviceDescriptor,
    port: u16,
    backend: Arc<dyn CaptureBackend>,

    /// Held across a blocking frame read so open and close never race it
    handle: Mutex<Option<Box<dyn CaptureHandle>>>,
    opened: AtomicBool,
    geometry: parking_lot::Mutex<(u32, u32)>,

    mjpeg: FrameSlot,
    flv: FrameSlot,
    last_frame_ms: AtomicI64,

    viewers: AtomicUsize,
    viewer_since_ms: AtomicI64,
    recording_active: AtomicBool,
    broadcast_active: AtomicBool,
    interest: Notify,

    recording: Mutex<RecordingSlot>,
    broadcasts: Mutex<BroadcastSet>,
}

impl Device {
    pub fn new(descriptor: DeviceDescriptor, port: u16, backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            geometry: parking_lot::Mutex::new((descriptor.width, descriptor.height)),
            descriptor,
            port,
            backend,
            handle: Mutex::new(None),
            opened: AtomicBool::new(false),
            mjpeg: FrameSlot::new(),
            flv: FrameSlot::new(),
            last_frame_ms: AtomicI64::new(0),
            viewers: AtomicUsize::new(0),
            viewer_since_ms: AtomicI64::new(0),
            recording_active: AtomicBool::new(false),
            broadcast_active: AtomicBool::new(false),
            interest: Notify::new(),
            recording: Mutex::new(RecordingSlot::default()),
            broadcasts: Mutex::new(BroadcastSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn device_type(&self) -> DeviceType {
        self.descriptor.device_type
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn geometry(&self) -> (u32, u32) {
        *self.geometry.lock()
    }

    // Capture

    /// Open the capture handle if it is not open yet
    pub async fn open(&self) -> Result<(), CaptureError> {
        let mut guard = self.handle.lock().await;
        self.open_locked(&mut guard).await
    }

    async fn open_locked(
        &self,
        guard: &mut Option<Box<dyn CaptureHandle>>,
    ) -> Result<(), CaptureError> {
        if guard.is_some() {
            return Ok(());
        }
        let backend = Arc::clone(&self.backend);
        let descriptor = self.descriptor.clone();
        let handle = tokio::task::spawn_blocking(move || backend.open(&descriptor))
            .await
            .map_err(|e| CaptureError::Open(e.to_string()))??;

        self.update_geometry(handle.geometry());
        *guard = Some(handle);
        self.opened.store(true, Ordering::Release);
        tracing::info!(device = %self.name(), backend = self.backend.name(), "Device opened");
        Ok(())
    }

    /// Read one frame set, reopening the handle first if it was closed
    pub async fn capture(&self, codecs: CodecSet) -> Result<Vec<Frame>, CaptureError> {
        let mut guard = self.handle.lock().await;
        self.open_locked(&mut guard).await?;
        let Some(mut handle) = guard.take() else {
            return Err(CaptureError::Open("device handle missing".into()));
        };

        let (handle, result) = tokio::task::spawn_blocking(move || {
            let result = handle.get_frame(codecs);
            (handle, result)
        })
        .await
        .map_err(|e| CaptureError::Read(e.to_string()))?;

        self.update_geometry(handle.geometry());
        *guard = Some(handle);
        result
    }

    /// Release the capture handle and the held frames. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(mut handle) = guard.take() {
            handle.close();
            tracing::info!(device = %self.name(), "Device closed");
        }
        self.opened.store(false, Ordering::Release);
        self.mjpeg.clear();
        self.flv.clear();
    }

    fn update_geometry(&self, (width, height): (u32, u32)) {
        if width > 0 && height > 0 {
            *self.geometry.lock() = (width, height);
        }
    }

    /// Store a captured frame in its codec slot and wake the slot's readers
    pub fn publish(&self, frame: Frame) {
        self.last_frame_ms
            .store(frame.timestamp_ms, Ordering::Release);
        match frame.codec {
            Codec::Mjpeg => self.mjpeg.publish(frame),
            Codec::Flv => self.flv.publish(frame),
        }
    }

    pub fn subscribe(&self, codec: Codec) -> FrameReceiver {
        match codec {
            Codec::Mjpeg => self.mjpeg.subscribe(),
            Codec::Flv => self.flv.subscribe(),
        }
    }

    pub fn latest(&self, codec: Codec) -> Option<Frame> {
        match codec {
            Codec::Mjpeg => self.mjpeg.latest(),
            Codec::Flv => self.flv.latest(),
        }
    }

    /// Capture time of the newest frame, 0 before the first
    pub fn last_frame_ms(&self) -> i64 {
        self.last_frame_ms.load(Ordering::Acquire)
    }

    // Consumer interest

    /// Codecs the current consumers need; empty means nobody is interested
    pub fn demanded_codecs(&self) -> CodecSet {
        let mut codecs = CodecSet::EMPTY;
        if self.viewers() > 0 || self.recording_active.load(Ordering::Acquire) {
            codecs.insert(Codec::Mjpeg);
        }
        if self.broadcast_active.load(Ordering::Acquire) {
            codecs.insert(Codec::Flv);
        }
        codecs
    }

    pub fn has_interest(&self) -> bool {
        !self.demanded_codecs().is_empty()
    }

    /// Wait until some consumer signals interest
    pub async fn interest_changed(&self) {
        self.interest.notified().await;
    }

    fn notify_interest(&self) {
        self.interest.notify_one();
    }

    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::Acquire)
    }

    /// Time the newest viewer connected, 0 if none ever did
    pub fn viewer_since_ms(&self) -> i64 {
        self.viewer_since_ms.load(Ordering::Acquire)
    }

    /// Register a live viewer for as long as the guard lives
    pub fn add_viewer(self: &Arc<Self>) -> ViewerGuard {
        self.viewer_since_ms.store(now_ms(), Ordering::Release);
        let count = self.viewers.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(device = %self.name(), viewers = count, "Viewer connected");
        self.notify_interest();
        ViewerGuard {
            device: Arc::clone(self),
        }
    }

    // Recording

    /// Start recording `video_id` into `store`.
    ///
    /// `request_ts` (ms since epoch) is time zero of the recording.
    pub async fn start_recording(
        &self,
        video_id: &str,
        store: &VideoStore,
        request_ts: i64,
    ) -> Result<(), RecordingErrorCode> {
        let mut slot = self.recording.lock().await;
        let result = self.start_recording_locked(&mut slot, video_id, store, request_ts).await;
        if let Err(code) = result {
            if code != RecordingErrorCode::RecordingIsAlreadyInProcess {
                slot.last_error = Some(code);
            }
        }
        result
    }

    async fn start_recording_locked(
        &self,
        slot: &mut RecordingSlot,
        video_id: &str,
        store: &VideoStore,
        request_ts: i64,
    ) -> Result<(), RecordingErrorCode> {
        self.reap_failed_recording(slot).await;
        if slot.session.is_some() {
            return Err(RecordingErrorCode::RecordingIsAlreadyInProcess);
        }
        let path = store.video_path(video_id)?;
        if store.exists(video_id).await {
            return Err(RecordingErrorCode::VideoAlreadyExists);
        }
        if let Err(e) = store.ensure_folder().await {
            tracing::warn!(folder = %store.folder().display(), error = %e, "Cannot create video folder");
            return Err(RecordingErrorCode::RecordSessionError);
        }
        if let Err(e) = self.open().await {
            tracing::warn!(device = %self.name(), error = %e, "Cannot open device for recording");
            return Err(RecordingErrorCode::RecordSessionError);
        }

        let session = RecordingSession::start(
            video_id,
            &path,
            self.mjpeg.subscribe(),
            self.geometry(),
            request_ts,
        )
        .await?;

        slot.session = Some(session);
        slot.video_id = video_id.to_string();
        slot.last_duration_ms = 0;
        slot.last_error = None;
        self.recording_active.store(true, Ordering::Release);
        self.notify_interest();
        Ok(())
    }

    /// Stop the current recording, if any
    pub async fn stop_recording(&self) {
        let mut slot = self.recording.lock().await;
        if let Some(session) = slot.session.take() {
            self.recording_active.store(false, Ordering::Release);
            slot.last_duration_ms = session.close().await;
            slot.video_id.clear();
        }
    }

    /// Drop a recording whose writer gave up, keeping its error for the
    /// status report
    async fn reap_failed_recording(&self, slot: &mut RecordingSlot) {
        let failed = slot
            .session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Error);
        if !failed {
            return;
        }
        if let Some(session) = slot.session.take() {
            self.recording_active.store(false, Ordering::Release);
            tracing::warn!(
                device = %self.name(),
                video_id = %session.video_id(),
                "Recording failed"
            );
            slot.last_duration_ms = session.close().await;
            slot.video_id.clear();
            slot.last_error = Some(RecordingErrorCode::RecordSessionError);
        }
    }

    /// Clean up sessions whose writers stopped on their own. The capture
    /// loop calls this between reads.
    pub async fn reap_failed_sessions(&self) {
        let mut slot = self.recording.lock().await;
        self.reap_failed_recording(&mut slot).await;
    }

    pub async fn recording_status(&self) -> RecordingStatus {
        let mut slot = self.recording.lock().await;
        self.reap_failed_recording(&mut slot).await;
        RecordingStatus {
            active: slot.session.is_some(),
            video_id: slot.video_id.clone(),
            duration_ms: slot
                .session
                .as_ref()
                .map(|s| s.duration_ms())
                .unwrap_or(slot.last_duration_ms),
            last_error: slot.last_error,
        }
    }

    /// True while `video_id` is being recorded on this device
    pub async fn is_recording(&self, video_id: &str) -> bool {
        let mut slot = self.recording.lock().await;
        self.reap_failed_recording(&mut slot).await;
        slot.session.as_ref().is_some_and(|s| s.video_id() == video_id)
    }

    // Broadcast

    /// Activate, deactivate or retarget one broadcast destination.
    ///
    /// Returns false when activation failed; the session then reports the
    /// cause through its error code.
    pub async fn set_outer_stream(
        &self,
        kind: OuterStreamKind,
        url: &str,
        active: bool,
        ffmpeg: Option<&Path>,
    ) -> bool {
        let mut set = self.broadcasts.lock().await;
        let ok = self.set_outer_stream_locked(&mut set, kind, url, active, ffmpeg).await;
        self.broadcast_active.store(set.any_active(), Ordering::Release);
        self.notify_interest();
        ok
    }

    async fn set_outer_stream_locked(
        &self,
        set: &mut BroadcastSet,
        kind: OuterStreamKind,
        url: &str,
        active: bool,
        ffmpeg: Option<&Path>,
    ) -> bool {
        let Some(session) = set.get_mut(kind) else {
            return false;
        };
        if session.state() == SessionState::NotAvailable {
            tracing::debug!(device = %self.name(), kind = %kind, "Broadcast kind not available, ignoring");
            return true;
        }

        if !active {
            if session.state().is_active() {
                session.close().await;
            }
            session.set_url(url);
            return true;
        }

        if let Err(e) = self.open().await {
            tracing::warn!(device = %self.name(), error = %e, "Cannot open device for broadcast");
            session.set_url(url);
            session.fail(BroadcastErrorCode::OpenVideoDevice);
            return false;
        }

        if session.state().is_active() {
            if session.url() == url {
                return true;
            }
            session.close().await;
        }
        session.init(url, self.flv.subscribe(), ffmpeg).await
    }

    pub async fn broadcast_status(&self) -> Vec<BroadcastStatus> {
        let set = self.broadcasts.lock().await;
        set.iter()
            .map(|s| BroadcastStatus {
                kind: s.kind(),
                url: s.url().to_string(),
                state: s.state(),
                error: s.error_code(),
            })
            .collect()
    }

    /// Stop every session fed by this device
    pub async fn stop_sessions(&self) {
        self.stop_recording().await;
        let mut set = self.broadcasts.lock().await;
        set.close_all().await;
        self.broadcast_active.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.descriptor.name)
            .field("type", &self.descriptor.device_type)
            .field("port", &self.port)
            .field("opened", &self.is_opened())
            .field("viewers", &self.viewers())
            .finish()
    }
}

/// Live viewer registration; dropping it decrements the viewer count
pub struct ViewerGuard {
    device: Arc<Device>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let prev = self.device.viewers.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(
            device = %self.device.name(),
            viewers = prev.saturating_sub(1),
            "Viewer disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::SyntheticCapture;

    fn synthetic(url: &str) -> Arc<Device> {
        let descriptor = DeviceDescriptor::stream("test", url, Duration::ZERO);
        Arc::new(Device::new(descriptor, 9100, Arc::new(SyntheticCapture::new())))
    }

    #[tokio::test]
    async fn test_interest_follows_consumers() {
        let device = synthetic("synthetic://test");
        assert!(!device.has_interest());

        let viewer = device.add_viewer();
        assert_eq!(device.viewers(), 1);
        assert_eq!(device.demanded_codecs(), CodecSet::MJPEG);

        drop(viewer);
        assert_eq!(device.viewers(), 0);
        assert!(!device.has_interest());
    }

    #[tokio::test]
    async fn test_capture_opens_and_close_releases() {
        let device = synthetic("synthetic://test?fps=100");
        let frames = device.capture(CodecSet::MJPEG | CodecSet::FLV).await.unwrap();
        assert!(device.is_opened());
        assert_eq!(frames.len(), 2);
        assert_eq!(device.geometry(), (320, 240));

        for frame in frames {
            device.publish(frame);
        }
        assert!(device.latest(Codec::Mjpeg).is_some());
        assert!(device.last_frame_ms() > 0);

        device.close().await;
        device.close().await;
        assert!(!device.is_opened());
        assert!(device.latest(Codec::Mjpeg).is_none());
    }

    #[tokio::test]
    async fn test_second_recording_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = VideoStore::new(dir.path());
        let device = synthetic("synthetic://test");

        device.start_recording("one", &store, 0).await.unwrap();
        assert_eq!(device.demanded_codecs(), CodecSet::MJPEG);
        assert_eq!(
            device.start_recording("two", &store, 0).await,
            Err(RecordingErrorCode::RecordingIsAlreadyInProcess)
        );

        let status = device.recording_status().await;
        assert!(status.active);
        assert_eq!(status.video_id, "one");
        assert!(status.last_error.is_none());
        assert!(device.is_recording("one").await);

        device.stop_recording().await;
        assert!(!device.recording_status().await.active);
        assert!(!device.has_interest());
    }

    #[tokio::test]
    async fn test_failed_recording_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = VideoStore::new(dir.path());
        let device = synthetic("synthetic://test?fps=100");

        device.start_recording("broken", &store, 0).await.unwrap();
        // A directory in place of the sidecar makes the next write fail
        let sidecar = crate::storage::metadata_path_for(&store.video_path("broken").unwrap());
        std::fs::remove_file(&sidecar).unwrap();
        std::fs::create_dir(&sidecar).unwrap();

        for frame in device.capture(CodecSet::MJPEG).await.unwrap() {
            device.publish(frame);
        }
        let status = loop {
            let status = device.recording_status().await;
            if !status.active {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(status.video_id, "");
        assert_eq!(status.last_error, Some(RecordingErrorCode::RecordSessionError));
        assert!(!device.is_recording("broken").await);
        assert!(!device.has_interest());

        // The slot is free again
        device.start_recording("retry", &store, 0).await.unwrap();
        device.stop_recording().await;
    }

    #[tokio::test]
    async fn test_recording_rejects_existing_and_empty_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = VideoStore::new(dir.path());
        std::fs::write(dir.path().join("taken.flv"), b"x").unwrap();
        let device = synthetic("synthetic://test");

        assert_eq!(
            device.start_recording("taken", &store, 0).await,
            Err(RecordingErrorCode::VideoAlreadyExists)
        );
        assert_eq!(
            device.start_recording("", &store, 0).await,
            Err(RecordingErrorCode::VideoNotFound)
        );
        assert_eq!(
            device.recording_status().await.last_error,
            Some(RecordingErrorCode::VideoNotFound)
        );
        assert!(!device.is_opened());
    }

    #[tokio::test]
    async fn test_recording_fails_when_device_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = VideoStore::new(dir.path());
        let descriptor = DeviceDescriptor::stream("gone", "rtsp://nowhere", Duration::ZERO);
        let device = Device::new(descriptor, 9101, Arc::new(SyntheticCapture::new()));

        assert_eq!(
            device.start_recording("v", &store, 0).await,
            Err(RecordingErrorCode::RecordSessionError)
        );
    }

    #[tokio::test]
    async fn test_unavailable_broadcast_is_a_no_op() {
        let device = synthetic("synthetic://test");

        assert!(
            device
                .set_outer_stream(OuterStreamKind::Twitch, "rtmp://a/b", true, None)
                .await
        );
        let status = device.broadcast_status().await;
        let twitch = status.iter().find(|s| s.kind == OuterStreamKind::Twitch).unwrap();
        assert_eq!(twitch.state, SessionState::NotAvailable);
        assert_eq!(twitch.url, "");
        assert!(!device.is_opened());
    }

    #[tokio::test]
    async fn test_inactive_broadcast_updates_url() {
        let device = synthetic("synthetic://test");

        assert!(
            device
                .set_outer_stream(OuterStreamKind::Ustream, "rtmp://a/b", false, None)
                .await
        );
        let status = device.broadcast_status().await;
        assert_eq!(status[0].url, "rtmp://a/b");
        assert_eq!(status[0].state, SessionState::Disabled);
    }

    #[tokio::test]
    async fn test_broadcast_with_bad_url_reports_error() {
        let device = synthetic("synthetic://test");

        assert!(
            !device
                .set_outer_stream(OuterStreamKind::Ustream, "nope", true, None)
                .await
        );
        let status = device.broadcast_status().await;
        assert_eq!(status[0].state, SessionState::Error);
        assert_eq!(status[0].error, BroadcastErrorCode::Url);
        assert!(!device.demanded_codecs().contains(Codec::Flv));
    }
}
