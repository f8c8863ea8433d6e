//! Recorded video playback
//!
//! Streams one recording to one client as multipart MJPEG, starting at a
//! requested offset and paced by a speed multiplier. A blocking reader
//! thread seeks the file to the frame due at each moment and publishes it
//! into a private [`FrameSlot`]; the connection task serves whatever the
//! slot holds. Nothing here is registered with the device registry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::capture::file::RecordedVideo;
use crate::capture::{Codec, Frame};
use crate::error::Result;
use crate::registry::FrameSlot;
use crate::server::{response, Connection};

/// Pause before re-reading when the due frame was already served
const IDLE_DELAY: Duration = Duration::from_millis(10);

/// Fastest accepted playback speed
pub const MAX_SPEED: f64 = 1000.0;

/// Stream timestamp due after `elapsed_ms` of wall time. Saturates instead
/// of overflowing for extreme offsets and speeds.
pub fn target_timestamp(elapsed_ms: i64, speed: f64, first_ts: i64, pos: i64) -> i64 {
    // float to int casts saturate
    let advanced = (elapsed_ms as f64 * speed) as i64;
    advanced.saturating_add(first_ts).saturating_add(pos)
}

/// Clamp a requested speed into (0, MAX_SPEED]; anything unusable plays at 1
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed.min(MAX_SPEED)
    } else {
        1.0
    }
}

/// One playback request
pub struct PlaybackSession {
    video_id: String,
    path: PathBuf,
    video: RecordedVideo,
    pos: i64,
    speed: f64,
}

impl PlaybackSession {
    /// Open and index the recording
    pub async fn open(video_id: &str, path: &Path, pos: i64, speed: f64) -> std::io::Result<Self> {
        let owned = path.to_path_buf();
        let video = tokio::task::spawn_blocking(move || RecordedVideo::open(&owned))
            .await
            .map_err(std::io::Error::other)??;
        Ok(Self {
            video_id: video_id.to_string(),
            path: path.to_path_buf(),
            video,
            pos: pos.max(0),
            speed: clamp_speed(speed),
        })
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Serve the recording until it ends, the client goes away or
    /// `shutdown` is raised. The reader thread has exited when this returns.
    pub async fn serve<S>(self, conn: &mut Connection<S>, shutdown: watch::Receiver<bool>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let slot = FrameSlot::new();
        let mut frames = slot.subscribe();
        let stop = Arc::new(AtomicBool::new(false));

        tracing::info!(
            video_id = %self.video_id,
            path = %self.path.display(),
            pos = self.pos,
            speed = self.speed,
            "Playback started"
        );

        let reader = {
            let stop = Arc::clone(&stop);
            let Self {
                video_id,
                video,
                pos,
                speed,
                ..
            } = self;
            tokio::task::spawn_blocking(move || read_loop(&video_id, video, slot, pos, speed, &stop))
        };

        let result = serve_frames(conn, &mut frames, shutdown).await;

        stop.store(true, Ordering::Release);
        if let Err(e) = reader.await {
            tracing::warn!(error = %e, "Playback reader panicked");
        }
        tracing::info!("Playback finished");
        result
    }
}

async fn serve_frames<S>(
    conn: &mut Connection<S>,
    frames: &mut crate::registry::FrameReceiver,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.write_all(response::mjpeg_preamble().as_bytes()).await?;
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    None
                } else {
                    continue;
                }
            }
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        conn.write_all(&response::mjpeg_part(&frame.data, frame.timestamp_ms))
            .await?;
    }
}

/// Publish the frame due at each moment until the end of the file. Dropping
/// the slot on return ends the consumer's stream.
fn read_loop(
    video_id: &str,
    mut video: RecordedVideo,
    slot: FrameSlot,
    pos: i64,
    speed: f64,
    stop: &AtomicBool,
) {
    let (Some(first), Some(last)) = (video.first_timestamp(), video.last_timestamp()) else {
        tracing::warn!(video_id = %video_id, "Recording has no frames");
        return;
    };
    let start = Instant::now();
    let mut served: Option<u32> = None;

    while !stop.load(Ordering::Acquire) {
        let elapsed = start.elapsed().as_millis() as i64;
        let target = target_timestamp(elapsed, speed, first as i64, pos);

        match video.frame_at(target) {
            Ok(Some((ts, image))) if served != Some(ts) => {
                served = Some(ts);
                slot.publish(Frame::new(Codec::Mjpeg, image, ts as i64));
            }
            Ok(_) => std::thread::sleep(IDLE_DELAY),
            Err(e) => {
                tracing::warn!(video_id = %video_id, error = %e, "Playback read failed");
                return;
            }
        }

        if target > last as i64 {
            tracing::debug!(video_id = %video_id, "End of recording");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::{duplex, AsyncReadExt};

    use super::*;
    use crate::media::flv::{encode_header, FlvTag, VideoCodec};

    fn write_recording(path: &Path, timestamps: &[u32]) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&encode_header(true, false)).unwrap();
        for (i, ts) in timestamps.iter().enumerate() {
            let image = [0xFF, 0xD8, i as u8, 0xFF, 0xD9];
            let tag = FlvTag::video(*ts, VideoCodec::Jpeg, true, &image);
            file.write_all(&tag.encode()).unwrap();
        }
    }

    #[test]
    fn test_target_timestamp() {
        let t0 = 1_000;
        assert_eq!(target_timestamp(0, 2.0, t0, 5000), t0 + 5000);
        assert_eq!(target_timestamp(300, 2.0, t0, 5000), t0 + 5000 + 600);
        assert_eq!(target_timestamp(300, 0.5, t0, 0), t0 + 150);
    }

    #[test]
    fn test_target_timestamp_saturates() {
        assert_eq!(target_timestamp(1, 1.0, 1000, i64::MAX), i64::MAX);
        assert_eq!(target_timestamp(10, 1e300, 5, 0), i64::MAX);
        assert_eq!(target_timestamp(i64::MAX, f64::MAX, i64::MAX, i64::MAX), i64::MAX);
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(2.0), 2.0);
        assert_eq!(clamp_speed(1e300), MAX_SPEED);
        assert_eq!(clamp_speed(0.0), 1.0);
        assert_eq!(clamp_speed(-3.0), 1.0);
        assert_eq!(clamp_speed(f64::NAN), 1.0);
    }

    async fn play(path: &Path, pos: i64, speed: f64) -> String {
        let session = PlaybackSession::open("flight", path, pos, speed).await.unwrap();
        let (mut client, server) = duplex(64 * 1024);
        let mut conn = Connection::new(1, server, None);
        let (_tx, shutdown) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), session.serve(&mut conn, shutdown))
            .await
            .unwrap()
            .unwrap();
        drop(conn);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_extreme_position_and_speed_end_playback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.flv");
        write_recording(&path, &[0, 40, 80]);

        let text = play(&path, i64::MAX, 1.0).await;
        assert!(text.matches("Content-Type: image/jpeg").count() <= 1);

        let text = play(&path, 0, 1e300).await;
        assert!(text.matches("Content-Type: image/jpeg").count() <= 3);

        // Negative offsets play from the start
        let text = play(&path, i64::MIN, 4.0).await;
        assert!(text.contains("X-Timestamp: 0.000000"));
    }

    #[tokio::test]
    async fn test_parts_carry_recorded_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.flv");
        write_recording(&path, &[0, 1000, 2000]);

        let text = play(&path, 2000, 1.0).await;
        assert!(text.contains("X-Timestamp: 2.000000"), "{}", text);
    }

    #[tokio::test]
    async fn test_plays_to_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.flv");
        write_recording(&path, &[0, 40, 80, 120]);

        let session = PlaybackSession::open("flight", &path, 0, 4.0).await.unwrap();
        assert_eq!(session.video_id(), "flight");

        let (mut client, server) = duplex(64 * 1024);
        let mut conn = Connection::new(1, server, None);
        let (_tx, shutdown) = watch::channel(false);
        session.serve(&mut conn, shutdown).await.unwrap();
        drop(conn);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        let parts = text.matches("Content-Type: image/jpeg").count();
        assert!(parts >= 1 && parts <= 4, "parts = {}", parts);
    }

    #[tokio::test]
    async fn test_start_position_skips_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.flv");
        write_recording(&path, &[0, 1000, 2000]);

        // Starting past the last frame serves it once and ends
        let session = PlaybackSession::open("flight", &path, 5000, 1.0).await.unwrap();
        let (mut client, server) = duplex(64 * 1024);
        let mut conn = Connection::new(1, server, None);
        let (_tx, shutdown) = watch::channel(false);
        session.serve(&mut conn, shutdown).await.unwrap();
        drop(conn);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.matches("Content-Type: image/jpeg").count() <= 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_playback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.flv");
        write_recording(&path, &[0, 60_000]);

        let session = PlaybackSession::open("long", &path, 0, 1.0).await.unwrap();
        let (_client, server) = duplex(64 * 1024);
        let mut conn = Connection::new(1, server, None);
        let (tx, shutdown) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
        });
        tokio::time::timeout(Duration::from_secs(5), session.serve(&mut conn, shutdown))
            .await
            .unwrap()
            .unwrap();
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PlaybackSession::open("none", &dir.path().join("none.flv"), 0, 1.0)
            .await
            .is_err());
    }
}
