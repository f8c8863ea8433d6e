//! Session outputs
//!
//! A [`FrameSink`] receives frames from a session writer task. Recording
//! writes JPEG frames into an FLV file and keeps the duration sidecar up to
//! date; broadcasting pipes FLV tags into an `ffmpeg` publisher process.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, Command};

use crate::capture::Frame;
use crate::media::flv::{self, FlvTag, FlvTagType, VideoCodec};
use crate::media::metadata::StreamMetadata;
use crate::storage;

/// If the first frame arrives later than this after the request, it is
/// also written at timestamp zero so the recording starts at the request
const FIRST_FRAME_MAX_LAG_MS: i64 = 100;

/// How long a publisher gets to drain after its input is closed
const PUBLISHER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination of a session writer
pub trait FrameSink: Send + 'static {
    fn write_frame(&mut self, frame: &Frame) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and finalize the output
    fn finish(self) -> impl Future<Output = io::Result<()>> + Send;
}

/// FLV recording file plus duration sidecar
pub struct RecordingSink {
    file: BufWriter<File>,
    metadata_path: PathBuf,
    request_ts: i64,
    duration_ms: Arc<AtomicI64>,
    frames_written: u64,
}

impl RecordingSink {
    /// Create the recording. Fails if the file already exists.
    pub async fn create(
        path: &Path,
        geometry: (u32, u32),
        request_ts: i64,
        duration_ms: Arc<AtomicI64>,
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let mut file = BufWriter::new(file);

        file.write_all(&flv::encode_header(true, false)).await?;
        let meta = StreamMetadata::for_video(geometry.0, geometry.1).encode();
        file.write_all(&FlvTag::script(0, meta).encode()).await?;
        file.flush().await?;

        let metadata_path = storage::metadata_path_for(path);
        storage::write_duration(&metadata_path, 0).await?;

        Ok(Self {
            file,
            metadata_path,
            request_ts,
            duration_ms,
            frames_written: 0,
        })
    }

    async fn write_jpeg(&mut self, timestamp: u32, image: &[u8]) -> io::Result<()> {
        let tag = FlvTag::video(timestamp, VideoCodec::Jpeg, true, image);
        self.file.write_all(&tag.encode()).await
    }
}

impl FrameSink for RecordingSink {
    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let offset = (frame.timestamp_ms - self.request_ts).max(0);

        if self.frames_written == 0 && offset > FIRST_FRAME_MAX_LAG_MS {
            self.write_jpeg(0, &frame.data).await?;
        }
        self.write_jpeg(offset as u32, &frame.data).await?;
        self.file.flush().await?;
        self.frames_written += 1;

        self.duration_ms.store(offset, Ordering::Release);
        storage::write_duration(&self.metadata_path, offset).await
    }

    async fn finish(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await
    }
}

/// Pushes an FLV stream to a broadcast URL through ffmpeg
pub struct PublishSink {
    child: Child,
    stdin: Option<ChildStdin>,
    base_ts: Option<i64>,
}

impl PublishSink {
    pub async fn spawn(ffmpeg: &Path, url: &str) -> io::Result<Self> {
        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "flv", "-i", "pipe:0", "-c", "copy", "-f", "flv", url])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "publisher stdin"))?;
        stdin.write_all(&flv::encode_header(true, false)).await?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            base_ts: None,
        })
    }
}

impl FrameSink for PublishSink {
    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        // The publisher exiting means the destination went away
        if let Some(status) = self.child.try_wait()? {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("publisher exited: {}", status),
            ));
        }
        let base = *self.base_ts.get_or_insert(frame.timestamp_ms);
        let tag = FlvTag {
            tag_type: FlvTagType::Video,
            timestamp: (frame.timestamp_ms - base).max(0) as u32,
            data: frame.data.clone(),
        };
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "publisher closed"))?;
        stdin.write_all(&tag.encode()).await
    }

    async fn finish(mut self) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(PUBLISHER_EXIT_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
