//! Session state machine
//!
//! Recording and broadcast sessions share one lifecycle:
//!
//! ```text
//! NotAvailable   (kind not supported, never leaves this state)
//! Disabled ──init──► Pending ──first write──► Running
//!                       │                        │
//!                       └──────► Error ◄─────────┘
//! close() from any state except NotAvailable ──► Disabled
//! ```
//!
//! The state lives in atomics so the control endpoint can report it while
//! the writer task updates it.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Session lifecycle state, reported as its numeric value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAvailable = 0,
    Disabled = 1,
    Pending = 2,
    Running = 3,
    Error = 4,
}

impl SessionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::NotAvailable,
            1 => SessionState::Disabled,
            2 => SessionState::Pending,
            3 => SessionState::Running,
            _ => SessionState::Error,
        }
    }

    /// Pending or Running
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Running)
    }
}

/// Error codes for recording and video management, sent as the 400 body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingErrorCode {
    Unknown = 0,
    VideoNotFound = 1,
    VideoAlreadyExists = 2,
    DeviceNotFound = 3,
    RecordingIsAlreadyInProcess = 4,
    MetadataNotFound = 5,
    RecordSessionError = 6,
}

impl RecordingErrorCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for RecordingErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::error::Error for RecordingErrorCode {}

/// Error codes for outbound broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastErrorCode {
    Unknown = 0,
    OpenVideoDevice = 1,
    SendData = 2,
    OpenCodec = 3,
    CodecNotFound = 4,
    Url = 5,
    None = 6,
}

impl BroadcastErrorCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BroadcastErrorCode::OpenVideoDevice,
            2 => BroadcastErrorCode::SendData,
            3 => BroadcastErrorCode::OpenCodec,
            4 => BroadcastErrorCode::CodecNotFound,
            5 => BroadcastErrorCode::Url,
            6 => BroadcastErrorCode::None,
            _ => BroadcastErrorCode::Unknown,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn message(self) -> &'static str {
        match self {
            BroadcastErrorCode::Unknown => "Unknown error",
            BroadcastErrorCode::OpenVideoDevice => "Video capturing open error",
            BroadcastErrorCode::SendData => "Error while sending data",
            BroadcastErrorCode::OpenCodec => "Could not open output",
            BroadcastErrorCode::CodecNotFound => "Encoder not found",
            BroadcastErrorCode::Url => "Invalid broadcast URL",
            BroadcastErrorCode::None => "",
        }
    }
}

/// Shared, lock-free session status
#[derive(Debug)]
pub struct SessionStatus {
    state: AtomicU8,
    error: AtomicU8,
}

impl SessionStatus {
    pub fn new(state: SessionState, error: u8) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            error: AtomicU8::new(error),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn error(&self) -> u8 {
        self.error.load(Ordering::Acquire)
    }

    pub fn set(&self, state: SessionState, error: u8) {
        self.error.store(error, Ordering::Release);
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to` only if still in `from`
    pub fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
