//! Recorded video input
//!
//! Reads the JPEG-in-FLV files written by recording sessions, both as a
//! paced FILE device and as a seekable source for playback.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::ffmpeg::FlvEncoder;
use super::{
    now_ms, CaptureBackend, CaptureHandle, Codec, CodecSet, DeviceDescriptor, DeviceType, Frame,
};
use crate::error::CaptureError;
use crate::media::flv::{FlvReader, IndexEntry, VideoCodec};
use crate::media::jpeg;

/// Random access reader over a JPEG-in-FLV recording
pub struct RecordedVideo {
    reader: FlvReader<BufReader<File>>,
    index: Vec<IndexEntry>,
}

impl RecordedVideo {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut reader = FlvReader::new(BufReader::new(File::open(path)?));
        reader.read_header()?;
        let index = reader.build_index()?;
        Ok(Self { reader, index })
    }

    /// Check the header and first video tag without indexing the file
    pub fn probe(path: &Path) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };
        let mut reader = FlvReader::new(BufReader::new(file).take(1 << 20));
        if !matches!(reader.read_header(), Ok((true, _))) {
            return false;
        }
        matches!(
            reader.read_video_tag(),
            Ok(Some(tag)) if tag.video_codec() == Some(VideoCodec::Jpeg)
        )
    }

    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    pub fn first_timestamp(&self) -> Option<u32> {
        self.index.first().map(|e| e.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<u32> {
        self.index.last().map(|e| e.timestamp)
    }

    /// Position of the last frame at or before `timestamp`
    fn position_at(&self, timestamp: i64) -> Option<usize> {
        let after = self
            .index
            .partition_point(|e| (e.timestamp as i64) <= timestamp);
        after.checked_sub(1)
    }

    /// The frame being displayed at `timestamp`: (frame timestamp, JPEG)
    pub fn frame_at(&mut self, timestamp: i64) -> io::Result<Option<(u32, Bytes)>> {
        let Some(pos) = self.position_at(timestamp) else {
            return Ok(None);
        };
        self.read_entry(pos)
    }

    /// Frame by position in the index
    pub fn read_entry(&mut self, pos: usize) -> io::Result<Option<(u32, Bytes)>> {
        let Some(entry) = self.index.get(pos).copied() else {
            return Ok(None);
        };
        self.reader.seek_to(entry.offset)?;
        Ok(self
            .reader
            .read_video_tag()?
            .map(|tag| (tag.timestamp, tag.video_payload())))
    }
}

/// Backend for FILE devices that point at our own recordings
#[derive(Debug, Clone)]
pub struct FileCapture {
    ffmpeg: Option<PathBuf>,
}

impl FileCapture {
    /// `ffmpeg` is only needed to serve FLV consumers
    pub fn new(ffmpeg: Option<PathBuf>) -> Self {
        Self { ffmpeg }
    }
}

impl CaptureBackend for FileCapture {
    fn name(&self) -> &'static str {
        "file"
    }

    fn check(&self, device: &DeviceDescriptor) -> bool {
        device.device_type == DeviceType::File && RecordedVideo::probe(&device.file_path())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let path = device.file_path();
        let video = RecordedVideo::open(&path)
            .map_err(|e| CaptureError::Open(format!("{}: {}", path.display(), e)))?;
        let ffmpeg = self
            .ffmpeg
            .clone()
            .or_else(|| which::which("ffmpeg").ok());

        Ok(Box::new(FileHandle {
            video,
            next: 0,
            started: None,
            geometry: (device.width, device.height),
            ffmpeg,
            encoder: None,
            name: device.name.clone(),
        }))
    }
}

/// Plays a recording from the start at its native rate
struct FileHandle {
    video: RecordedVideo,
    next: usize,
    /// Wall clock and file timestamp of the first served frame
    started: Option<(Instant, u32)>,
    geometry: (u32, u32),
    ffmpeg: Option<PathBuf>,
    encoder: Option<FlvEncoder>,
    name: String,
}

impl CaptureHandle for FileHandle {
    fn get_frame(&mut self, codecs: CodecSet) -> Result<Vec<Frame>, CaptureError> {
        let (ts, image) = self
            .video
            .read_entry(self.next)?
            .ok_or(CaptureError::EndOfStream)?;
        self.next += 1;

        match self.started {
            None => self.started = Some((Instant::now(), ts)),
            Some((at, first)) => {
                let due = at + Duration::from_millis(ts.saturating_sub(first) as u64);
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
            }
        }

        if self.geometry == (0, 0) {
            if let Some(dims) = jpeg::dimensions(&image) {
                self.geometry = dims;
            }
        }

        let timestamp = now_ms();
        let mut frames = Vec::with_capacity(2);
        if codecs.contains(Codec::Flv) {
            let ffmpeg = self
                .ffmpeg
                .as_deref()
                .ok_or(CaptureError::ToolNotFound("ffmpeg"))?;
            if self.encoder.is_none() {
                self.encoder = Some(FlvEncoder::spawn(ffmpeg, &self.name)?);
            }
            if let Some(encoder) = self.encoder.as_mut() {
                if let Some(tag) = encoder.encode(&image)? {
                    frames.push(Frame::new(Codec::Flv, tag, timestamp));
                }
            }
        }
        if codecs.contains(Codec::Mjpeg) {
            frames.push(Frame::new(Codec::Mjpeg, image, timestamp));
        }
        Ok(frames)
    }

    fn geometry(&self) -> (u32, u32) {
        self.geometry
    }

    fn close(&mut self) {
        self.encoder = None;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::media::flv::{encode_header, FlvTag};

    fn write_recording(path: &Path, timestamps: &[u32]) {
        let mut file = File::create(path).unwrap();
        file.write_all(&encode_header(true, false)).unwrap();
        for (i, ts) in timestamps.iter().enumerate() {
            let image = [0xFF, 0xD8, i as u8, 0xFF, 0xD9];
            let tag = FlvTag::video(*ts, VideoCodec::Jpeg, true, &image);
            file.write_all(&tag.encode()).unwrap();
        }
    }

    #[test]
    fn test_frame_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.flv");
        write_recording(&path, &[1000, 1040, 1080, 1120]);

        let mut video = RecordedVideo::open(&path).unwrap();
        assert_eq!(video.frame_count(), 4);
        assert_eq!(video.first_timestamp(), Some(1000));
        assert_eq!(video.last_timestamp(), Some(1120));

        assert!(video.frame_at(999).unwrap().is_none());
        let (ts, image) = video.frame_at(1079).unwrap().unwrap();
        assert_eq!(ts, 1040);
        assert_eq!(image[2], 1);
        assert_eq!(video.frame_at(5000).unwrap().unwrap().0, 1120);
    }

    #[test]
    fn test_probe_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.flv");
        write_recording(&good, &[0]);
        assert!(RecordedVideo::probe(&good));

        let bad = dir.path().join("bad.flv");
        std::fs::write(&bad, b"not a video").unwrap();
        assert!(!RecordedVideo::probe(&bad));
        assert!(!RecordedVideo::probe(&dir.path().join("missing.flv")));
    }

    #[test]
    fn test_file_device_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.flv");
        write_recording(&path, &[0, 10]);

        let device = DeviceDescriptor::stream("rec", path.to_string_lossy(), Duration::ZERO);
        let backend = FileCapture::new(None);
        assert!(backend.check(&device));

        let mut handle = backend.open(&device).unwrap();
        assert_eq!(handle.get_frame(CodecSet::MJPEG).unwrap().len(), 1);
        assert_eq!(handle.get_frame(CodecSet::MJPEG).unwrap().len(), 1);
        assert_eq!(
            handle.get_frame(CodecSet::MJPEG).unwrap_err(),
            CaptureError::EndOfStream
        );
    }
}
