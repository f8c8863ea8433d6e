//! Synthetic test-pattern source
//!
//! Accepts `synthetic://<name>[?fps=N&fail_after=N&end_after=N]` URLs and
//! produces small, well-formed JPEG containers carrying a frame counter.
//! Used by tests and for exercising a server without a camera attached.

use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use super::{now_ms, CaptureBackend, CaptureHandle, Codec, CodecSet, DeviceDescriptor, Frame};
use crate::error::CaptureError;
use crate::media::flv::{FlvTag, VideoCodec};

const SCHEME: &str = "synthetic://";
const DEFAULT_FPS: u32 = 25;
const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;

/// Pattern parameters parsed from the URL query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternOptions {
    pub fps: u32,
    /// Every read fails once this many frames were produced
    pub fail_after: Option<u64>,
    /// End of stream once this many frames were produced
    pub end_after: Option<u64>,
}

impl PatternOptions {
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix(SCHEME)?;
        let mut options = Self {
            fps: DEFAULT_FPS,
            fail_after: None,
            end_after: None,
        };
        if let Some((_, query)) = rest.split_once('?') {
            for pair in query.split('&') {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };
                match key {
                    "fps" => options.fps = value.parse().unwrap_or(DEFAULT_FPS).max(1),
                    "fail_after" => options.fail_after = value.parse().ok(),
                    "end_after" => options.end_after = value.parse().ok(),
                    _ => {}
                }
            }
        }
        Some(options)
    }
}

/// Test-pattern backend
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture;

impl SyntheticCapture {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for SyntheticCapture {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn check(&self, device: &DeviceDescriptor) -> bool {
        device.url.starts_with(SCHEME)
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let options = PatternOptions::parse(&device.url)
            .ok_or_else(|| CaptureError::Open(format!("not a synthetic url: {}", device.url)))?;
        let width = if device.width > 0 { device.width } else { DEFAULT_WIDTH };
        let height = if device.height > 0 { device.height } else { DEFAULT_HEIGHT };

        Ok(Box::new(PatternHandle {
            interval: Duration::from_secs(1) / options.fps,
            options,
            width,
            height,
            produced: 0,
            next_due: None,
        }))
    }
}

struct PatternHandle {
    options: PatternOptions,
    interval: Duration,
    width: u32,
    height: u32,
    produced: u64,
    next_due: Option<Instant>,
}

impl CaptureHandle for PatternHandle {
    fn get_frame(&mut self, codecs: CodecSet) -> Result<Vec<Frame>, CaptureError> {
        if self.options.end_after.is_some_and(|n| self.produced >= n) {
            return Err(CaptureError::EndOfStream);
        }
        if self.options.fail_after.is_some_and(|n| self.produced >= n) {
            return Err(CaptureError::Read("synthetic failure".into()));
        }

        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);

        let image = pattern_jpeg(self.width, self.height, self.produced);
        self.produced += 1;

        let timestamp = now_ms();
        let mut frames = Vec::with_capacity(2);
        if codecs.contains(Codec::Flv) {
            let tag = FlvTag::video(0, VideoCodec::Jpeg, true, &image);
            frames.push(Frame::new(Codec::Flv, tag.data, timestamp));
        }
        if codecs.contains(Codec::Mjpeg) {
            frames.push(Frame::new(Codec::Mjpeg, image, timestamp));
        }
        Ok(frames)
    }

    fn geometry(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {}
}

/// SOI, a COM segment with the counter, a baseline SOF header, EOI
pub fn pattern_jpeg(width: u32, height: u32, counter: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(40);
    buf.put_slice(&[0xFF, 0xD8]);

    buf.put_slice(&[0xFF, 0xFE]);
    buf.put_u16(2 + 8);
    buf.put_u64(counter);

    buf.put_slice(&[0xFF, 0xC0]);
    buf.put_u16(11);
    buf.put_u8(8);
    buf.put_u16(height as u16);
    buf.put_u16(width as u16);
    buf.put_slice(&[1, 1, 0x11, 0]);

    buf.put_slice(&[0xFF, 0xD9]);
    buf.freeze()
}

/// Counter embedded by [`pattern_jpeg`]
pub fn pattern_counter(image: &[u8]) -> Option<u64> {
    let bytes = image.get(6..14)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}
