//! ffmpeg command line capture
//!
//! Cameras, network streams and foreign files are decoded by an `ffmpeg`
//! child process that writes MJPEG to its stdout. A reader thread splits the
//! pipe into JPEG images and drops them while the capture loop is busy, so a
//! slow consumer never makes the child block.
//!
//! FLV frames are produced on demand by a second `ffmpeg` process fed with
//! the captured JPEGs and encoding intra-only `flv1`, so dropping frames
//! downstream never corrupts the picture.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use super::{
    now_ms, CaptureBackend, CaptureHandle, Codec, CodecSet, DeviceDescriptor, DeviceType, Frame,
};
use crate::error::CaptureError;
use crate::media::flv::FlvReader;
use crate::media::jpeg::{self, JpegSplitter};

/// Pipe read size
const READ_CHUNK: usize = 64 * 1024;

/// Images larger than this are treated as garbage
const MAX_JPEG_SIZE: usize = 8 * 1024 * 1024;

/// Default time to wait for the next frame
const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(target_os = "linux")]
const CAMERA_INPUT_FORMAT: &str = "v4l2";
#[cfg(target_os = "macos")]
const CAMERA_INPUT_FORMAT: &str = "avfoundation";
#[cfg(target_os = "windows")]
const CAMERA_INPUT_FORMAT: &str = "dshow";
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const CAMERA_INPUT_FORMAT: &str = "v4l2";

#[cfg(target_os = "windows")]
const CAMERA_NAME_PREFIX: &str = "video=";
#[cfg(not(target_os = "windows"))]
const CAMERA_NAME_PREFIX: &str = "";

/// Capture backend that drives the ffmpeg CLI
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    ffmpeg: PathBuf,
    frame_timeout: Duration,
}

impl FfmpegCapture {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self {
            ffmpeg,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }

    /// Use the given binary, or find `ffmpeg` on PATH
    pub fn locate(explicit: Option<PathBuf>) -> Result<Self, CaptureError> {
        let path = match explicit {
            Some(path) if path.is_file() => path,
            Some(_) => return Err(CaptureError::ToolNotFound("ffmpeg")),
            None => which::which("ffmpeg").map_err(|_| CaptureError::ToolNotFound("ffmpeg"))?,
        };
        Ok(Self::new(path))
    }

    pub fn frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.ffmpeg
    }

    /// Input arguments for a device
    fn input_args(device: &DeviceDescriptor) -> Vec<String> {
        let mut args = Vec::new();
        match device.device_type {
            DeviceType::Camera => {
                args.extend(["-f".to_string(), CAMERA_INPUT_FORMAT.to_string()]);
                if device.width > 0 && device.height > 0 {
                    args.push("-video_size".to_string());
                    args.push(format!("{}x{}", device.width, device.height));
                }
                args.push("-i".to_string());
                args.push(format!("{}{}", CAMERA_NAME_PREFIX, device.url));
            }
            DeviceType::Stream => {
                args.push("-i".to_string());
                args.push(device.url.clone());
            }
            DeviceType::File => {
                // Read files at their native rate
                args.push("-re".to_string());
                args.push("-i".to_string());
                args.push(device.file_path().to_string_lossy().into_owned());
            }
        }
        args
    }
}

impl CaptureBackend for FfmpegCapture {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn check(&self, device: &DeviceDescriptor) -> bool {
        match device.device_type {
            DeviceType::Camera => {
                cfg!(not(target_os = "linux")) || Path::new(&device.url).exists()
            }
            DeviceType::Stream => {
                device.url.contains("://") && !device.url.starts_with("synthetic://")
            }
            DeviceType::File => device.file_path().is_file(),
        }
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(Self::input_args(device))
            .args(["-an", "-f", "mjpeg", "-q:v", "5", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| CaptureError::Open(format!("{}: {}", device.name, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Open("ffmpeg stdout unavailable".into()))?;

        let (tx, rx) = mpsc::sync_channel(2);
        let name = device.name.clone();
        thread::Builder::new()
            .name(format!("mjpeg-{}", device.name))
            .spawn(move || read_mjpeg(stdout, tx, name))
            .map_err(|e| CaptureError::Open(e.to_string()))?;

        tracing::debug!(device = %device.name, "ffmpeg capture started");

        Ok(Box::new(FfmpegHandle {
            child: Some(child),
            frames: rx,
            frame_timeout: self.frame_timeout,
            geometry: (device.width, device.height),
            encoder: None,
            ffmpeg: self.ffmpeg.clone(),
            name: device.name.clone(),
        }))
    }
}

/// Reader thread body: split the pipe into JPEGs, drop when the slot is busy
fn read_mjpeg<R: Read>(mut pipe: R, tx: SyncSender<Bytes>, name: String) {
    let mut splitter = JpegSplitter::new(MAX_JPEG_SIZE);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(device = %name, error = %e, "MJPEG pipe read failed");
                break;
            }
        };
        splitter.push(&chunk[..n]);
        while let Some(image) = splitter.next_frame() {
            match tx.try_send(image) {
                Ok(()) | Err(mpsc::TrySendError::Full(_)) => {}
                Err(mpsc::TrySendError::Disconnected(_)) => return,
            }
        }
    }
    tracing::debug!(device = %name, "MJPEG pipe closed");
}

struct FfmpegHandle {
    child: Option<Child>,
    frames: Receiver<Bytes>,
    frame_timeout: Duration,
    geometry: (u32, u32),
    encoder: Option<FlvEncoder>,
    ffmpeg: PathBuf,
    name: String,
}

impl FfmpegHandle {
    /// Latest buffered image, waiting for one if none is queued
    fn next_jpeg(&mut self) -> Result<Bytes, CaptureError> {
        let mut image = match self.frames.recv_timeout(self.frame_timeout) {
            Ok(image) => image,
            Err(RecvTimeoutError::Timeout) => return Err(CaptureError::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(CaptureError::EndOfStream),
        };
        while let Ok(newer) = self.frames.try_recv() {
            image = newer;
        }
        Ok(image)
    }
}

impl CaptureHandle for FfmpegHandle {
    fn get_frame(&mut self, codecs: CodecSet) -> Result<Vec<Frame>, CaptureError> {
        let image = self.next_jpeg()?;
        let timestamp = now_ms();

        if self.geometry == (0, 0) {
            if let Some(dims) = jpeg::dimensions(&image) {
                self.geometry = dims;
            }
        }

        let mut frames = Vec::with_capacity(2);
        if codecs.contains(Codec::Flv) {
            if self.encoder.is_none() {
                self.encoder = Some(FlvEncoder::spawn(&self.ffmpeg, &self.name)?);
            }
            if let Some(encoder) = self.encoder.as_mut() {
                match encoder.encode(&image) {
                    Ok(Some(tag)) => frames.push(Frame::new(Codec::Flv, tag, timestamp)),
                    Ok(None) => {}
                    Err(e) => {
                        self.encoder = None;
                        return Err(e);
                    }
                }
            }
        } else {
            // Nobody wants FLV any more
            self.encoder = None;
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
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!(device = %self.name, "ffmpeg capture stopped");
        }
    }
}

impl Drop for FfmpegHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// JPEG to intra-only FLV1 encoder process
pub struct FlvEncoder {
    child: Child,
    stdin: ChildStdin,
    tags: Receiver<Bytes>,
}

impl FlvEncoder {
    pub fn spawn(ffmpeg: &Path, name: &str) -> Result<Self, CaptureError> {
        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "mjpeg", "-i", "pipe:0"])
            .args(["-an", "-c:v", "flv1", "-g", "1", "-q:v", "5", "-f", "flv", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::Open(format!("flv encoder: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Open("flv encoder stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Open("flv encoder stdout unavailable".into()))?;

        let (tx, rx) = mpsc::sync_channel(4);
        let device = name.to_string();
        thread::Builder::new()
            .name(format!("flv-{}", name))
            .spawn(move || {
                let mut reader = FlvReader::new(stdout);
                if let Err(e) = reader.read_header() {
                    tracing::debug!(device = %device, error = %e, "FLV encoder produced no header");
                    return;
                }
                while let Ok(Some(tag)) = reader.read_video_tag() {
                    match tx.try_send(tag.data) {
                        Ok(()) | Err(mpsc::TrySendError::Full(_)) => {}
                        Err(mpsc::TrySendError::Disconnected(_)) => return,
                    }
                }
            })
            .map_err(|e| CaptureError::Open(e.to_string()))?;

        tracing::debug!(device = %name, "FLV encoder started");
        Ok(Self {
            child,
            stdin,
            tags: rx,
        })
    }

    /// Feed one image and return the newest encoded tag body, if any is ready
    pub fn encode(&mut self, image: &[u8]) -> Result<Option<Bytes>, CaptureError> {
        self.stdin
            .write_all(image)
            .and_then(|_| self.stdin.flush())
            .map_err(|e| CaptureError::Read(format!("flv encoder: {}", e)))?;

        let mut latest = None;
        loop {
            match self.tags.try_recv() {
                Ok(tag) => latest = Some(tag),
                Err(TryRecvError::Empty) => return Ok(latest),
                Err(TryRecvError::Disconnected) => {
                    return match latest {
                        Some(tag) => Ok(Some(tag)),
                        None => Err(CaptureError::Read("flv encoder exited".into())),
                    };
                }
            }
        }
    }
}

impl Drop for FlvEncoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
