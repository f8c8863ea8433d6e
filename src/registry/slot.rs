//! Single-slot overwrite-and-notify frame cell
//!
//! A `FrameSlot` holds only the most recent frame of one codec. Publishing
//! replaces the value and wakes every waiting reader; there is no queue, so
//! a slow reader skips straight to the newest frame. Built on
//! `tokio::sync::watch`, which gives exactly these semantics.
//!
//! The frame travels as one value, so a reader can never observe the bytes
//! of one publish together with the timestamp of another.

use tokio::sync::watch;

use crate::capture::Frame;

/// Latest-value cell for one codec
#[derive(Debug)]
pub struct FrameSlot {
    tx: watch::Sender<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replace the current frame and wake all readers. Never blocks.
    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(frame));
    }

    /// Drop the held frame, e.g. when the device closes
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Snapshot of the current frame
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Reader that waits for frames published after this call
    pub fn subscribe(&self) -> FrameReceiver {
        // New watch receivers treat the current value as already seen
        FrameReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live readers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiting side of a [`FrameSlot`]
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: watch::Receiver<Option<Frame>>,
}

impl FrameReceiver {
    /// Wait for the next published frame.
    ///
    /// Returns `None` once the slot is dropped. A `clear` is not a frame and
    /// is skipped.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }
}
