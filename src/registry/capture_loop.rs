//! Per-device capture loop
//!
//! One task per live device. While any consumer is interested it reads a
//! frame set for the demanded codecs and publishes each frame into its
//! slot; consumers pick frames up on their own schedule. With no interest
//! the device is closed and the loop parks until a consumer shows up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::device::Device;
use crate::capture::DeviceType;
use crate::error::CaptureError;

/// Pause between a failed read and the reopen attempt
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Why a capture loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    /// Shutdown was requested
    Stopped,
    /// Too many consecutive failures, or the end of a file
    Failed(CaptureError),
}

/// Run the capture loop of `device` until shutdown or failure.
///
/// The device is always closed when the loop returns.
pub async fn run(
    device: Arc<Device>,
    mut shutdown: watch::Receiver<bool>,
    max_failures: u32,
) -> CaptureExit {
    let max_failures = match device.device_type() {
        DeviceType::File => 1,
        _ => max_failures.max(1),
    };
    let mut failures = 0u32;

    let exit = loop {
        if *shutdown.borrow_and_update() {
            break CaptureExit::Stopped;
        }

        let codecs = device.demanded_codecs();
        if codecs.is_empty() {
            if device.is_opened() {
                tracing::debug!(device = %device.name(), "No consumers left");
                device.close().await;
            }
            tokio::select! {
                _ = device.interest_changed() => continue,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break CaptureExit::Stopped;
                    }
                    continue;
                }
            }
        }

        // Not raced against shutdown: the handle lives on the blocking pool
        // until the read returns, and only then can it be closed
        match device.capture(codecs).await {
            Ok(frames) => {
                failures = 0;
                for frame in frames {
                    device.publish(frame);
                }
                device.reap_failed_sessions().await;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    device = %device.name(),
                    error = %e,
                    failures = failures,
                    "Capture failed"
                );
                if failures >= max_failures {
                    break CaptureExit::Failed(e);
                }
                // Reopen on the next iteration
                device.close().await;
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    };

    device.close().await;
    match &exit {
        CaptureExit::Stopped => tracing::debug!(device = %device.name(), "Capture loop stopped"),
        CaptureExit::Failed(e) => {
            tracing::warn!(device = %device.name(), error = %e, "Capture loop gave up")
        }
    }
    exit
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::capture::{
        CaptureBackend, CaptureHandle, Codec, CodecSet, DeviceDescriptor, Frame, SyntheticCapture,
    };

    fn device(url: &str) -> Arc<Device> {
        let descriptor = DeviceDescriptor::stream("loop", url, Duration::ZERO);
        Arc::new(Device::new(descriptor, 9200, Arc::new(SyntheticCapture::new())))
    }

    #[tokio::test]
    async fn test_idle_until_interest() {
        let device = device("synthetic://loop?fps=100");
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(device.clone(), stop_rx, 10));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!device.is_opened());

        let viewer = device.add_viewer();
        let mut frames = device.subscribe(Codec::Mjpeg);
        let frame = frames.next().await.unwrap();
        assert_eq!(frame.codec, Codec::Mjpeg);
        assert!(device.is_opened());

        drop(viewer);
        stop_tx.send_replace(true);
        assert_eq!(task.await.unwrap(), CaptureExit::Stopped);
        assert!(!device.is_opened());
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_failures() {
        let device = device("synthetic://loop?fps=100&fail_after=0");
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _viewer = device.add_viewer();

        let exit = run(device.clone(), stop_rx, 3).await;
        assert!(matches!(exit, CaptureExit::Failed(CaptureError::Read(_))));
        assert!(!device.is_opened());
    }

    struct SlowBackend {
        closed: Arc<AtomicUsize>,
    }

    struct SlowHandle {
        closed: Arc<AtomicUsize>,
        counter: u64,
    }

    impl CaptureBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn check(&self, _device: &DeviceDescriptor) -> bool {
            true
        }

        fn open(&self, _device: &DeviceDescriptor) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            Ok(Box::new(SlowHandle {
                closed: self.closed.clone(),
                counter: 0,
            }))
        }
    }

    impl CaptureHandle for SlowHandle {
        fn get_frame(&mut self, _codecs: CodecSet) -> Result<Vec<Frame>, CaptureError> {
            std::thread::sleep(Duration::from_millis(200));
            self.counter += 1;
            let image = crate::capture::synthetic::pattern_jpeg(16, 16, self.counter);
            Ok(vec![Frame::new(Codec::Mjpeg, image, crate::capture::now_ms())])
        }

        fn geometry(&self) -> (u32, u32) {
            (16, 16)
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_read_closes_handle() {
        let closed = Arc::new(AtomicUsize::new(0));
        let descriptor = DeviceDescriptor::stream("slow", "slow://cam", Duration::ZERO);
        let device = Arc::new(Device::new(
            descriptor,
            9201,
            Arc::new(SlowBackend {
                closed: closed.clone(),
            }),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let _viewer = device.add_viewer();
        let task = tokio::spawn(run(device.clone(), stop_rx, 10));

        while !device.is_opened() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The first read is still sleeping on the blocking pool
        stop_tx.send_replace(true);
        assert_eq!(task.await.unwrap(), CaptureExit::Stopped);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!device.is_opened());
    }

    #[tokio::test]
    async fn test_consumers_skip_to_latest_frame() {
        let device = device("synthetic://loop?fps=200");
        let (stop_tx, stop_rx) = watch::channel(false);
        let _viewer = device.add_viewer();
        let mut slow = device.subscribe(Codec::Mjpeg);
        let task = tokio::spawn(run(device.clone(), stop_rx, 10));

        let first = slow.next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = slow.next().await.unwrap();
        // Frames published while the reader slept were overwritten
        let a = crate::capture::synthetic::pattern_counter(&first.data).unwrap();
        let b = crate::capture::synthetic::pattern_counter(&second.data).unwrap();
        assert!(b > a + 1);

        stop_tx.send_replace(true);
        task.await.unwrap();
    }
}
