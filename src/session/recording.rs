//! Recording session
//!
//! Writes a device's MJPEG frames into `<folder>/<video_id>.flv` and keeps
//! the duration sidecar current. A device holds at most one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::sink::RecordingSink;
use super::state::{RecordingErrorCode, SessionState, SessionStatus};
use super::{SessionWorker, CLOSE_TIMEOUT};
use crate::registry::slot::FrameReceiver;

/// A running recording
#[derive(Debug)]
pub struct RecordingSession {
    video_id: String,
    path: PathBuf,
    status: Arc<SessionStatus>,
    duration_ms: Arc<AtomicI64>,
    worker: SessionWorker,
}

impl RecordingSession {
    /// Open the output and start writing frames from `frames`.
    ///
    /// `request_ts` (ms since epoch) is time zero of the recording.
    pub async fn start(
        video_id: &str,
        path: &Path,
        frames: FrameReceiver,
        geometry: (u32, u32),
        request_ts: i64,
    ) -> Result<Self, RecordingErrorCode> {
        let status = Arc::new(SessionStatus::new(
            SessionState::Pending,
            RecordingErrorCode::Unknown.code(),
        ));
        let duration_ms = Arc::new(AtomicI64::new(0));

        let sink = RecordingSink::create(path, geometry, request_ts, duration_ms.clone())
            .await
            .map_err(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Cannot open recording output");
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    RecordingErrorCode::VideoAlreadyExists
                } else {
                    RecordingErrorCode::RecordSessionError
                }
            })?;

        let worker = SessionWorker::spawn(
            format!("record:{}", video_id),
            sink,
            frames,
            status.clone(),
            RecordingErrorCode::RecordSessionError.code(),
        );

        tracing::info!(video_id = %video_id, path = %path.display(), "Recording started");

        Ok(Self {
            video_id: video_id.to_string(),
            path: path.to_path_buf(),
            status,
            duration_ms,
            worker,
        })
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Milliseconds from the request to the last written frame
    pub fn duration_ms(&self) -> i64 {
        self.duration_ms.load(Ordering::Acquire)
    }

    /// Stop writing and finalize the file. Returns the final duration.
    pub async fn close(self) -> i64 {
        let Self {
            video_id,
            status,
            duration_ms,
            worker,
            ..
        } = self;
        worker.stop(CLOSE_TIMEOUT).await;
        status.set(SessionState::Disabled, RecordingErrorCode::Unknown.code());
        let duration = duration_ms.load(Ordering::Acquire);
        tracing::info!(
            video_id = %video_id,
            duration_ms = duration,
            "Recording stopped"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::capture::file::RecordedVideo;
    use crate::capture::{Codec, Frame};
    use crate::registry::slot::FrameSlot;
    use crate::storage;

    #[tokio::test]
    async fn test_record_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.flv");
        let slot = FrameSlot::new();

        let session = RecordingSession::start("flight", &path, slot.subscribe(), (0, 0), 1_000)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Pending);

        slot.publish(Frame::new(Codec::Mjpeg, Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 1_040));
        while session.state() != SessionState::Running {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.duration_ms(), 40);

        assert_eq!(session.close().await, 40);
        let md = std::fs::read_to_string(storage::metadata_path_for(&path)).unwrap();
        assert_eq!(md, "40");
        assert_eq!(RecordedVideo::open(&path).unwrap().frame_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.flv");
        std::fs::write(&path, b"x").unwrap();
        let slot = FrameSlot::new();

        let err = RecordingSession::start("dup", &path, slot.subscribe(), (0, 0), 0)
            .await
            .unwrap_err();
        assert_eq!(err, RecordingErrorCode::VideoAlreadyExists);
    }
}
