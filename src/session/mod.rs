//! Recording and broadcast sessions
//!
//! Each running session owns one writer task that waits on a device's
//! FrameSlot and writes every frame it observes into its sink. Stopping is a
//! handshake: [`SessionWorker::stop`] signals the task and waits (bounded)
//! until it has finalized the output.

pub mod broadcast;
pub mod recording;
pub mod sink;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::registry::slot::FrameReceiver;
use sink::FrameSink;
use state::{SessionState, SessionStatus};

pub use broadcast::{BroadcastSession, BroadcastSet, OuterStreamKind};
pub use recording::RecordingSession;
pub use state::{BroadcastErrorCode, RecordingErrorCode};

/// Upper bound for a writer to finalize its output after a stop request
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a session writer task
#[derive(Debug)]
pub struct SessionWorker {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionWorker {
    /// Spawn a writer feeding `sink` from `frames`.
    ///
    /// The status moves Pending -> Running on the first successful write and
    /// to Error with `fail_code` when the sink fails.
    pub fn spawn<S: FrameSink>(
        label: String,
        sink: S,
        frames: FrameReceiver,
        status: Arc<SessionStatus>,
        fail_code: u8,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_writer(label, sink, frames, stop_rx, status, fail_code));
        Self {
            stop: Some(stop_tx),
            task,
        }
    }

    /// True once the writer exited on its own (sink failure, device gone)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the writer and wait until it has finalized its output
    pub async fn stop(mut self, bound: Duration) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match tokio::time::timeout(bound, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Session writer panicked"),
            Err(_) => {
                tracing::warn!(timeout_secs = bound.as_secs(), "Session writer did not stop in time");
                self.task.abort();
            }
        }
    }
}

async fn run_writer<S: FrameSink>(
    label: String,
    mut sink: S,
    mut frames: FrameReceiver,
    mut stop: oneshot::Receiver<()>,
    status: Arc<SessionStatus>,
    fail_code: u8,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = frames.next() => frame,
        };
        let Some(frame) = frame else {
            tracing::debug!(session = %label, "Frame source closed");
            break;
        };

        if let Err(e) = sink.write_frame(&frame).await {
            tracing::warn!(session = %label, error = %e, "Session write failed");
            status.set(SessionState::Error, fail_code);
            break;
        }
        if status.advance(SessionState::Pending, SessionState::Running) {
            tracing::info!(session = %label, "Session running");
        }
    }

    if let Err(e) = sink.finish().await {
        tracing::warn!(session = %label, error = %e, "Failed to finalize session output");
    }
    tracing::debug!(session = %label, "Session writer stopped");
}
