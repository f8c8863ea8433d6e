//! Outbound broadcast sessions
//!
//! Every device carries one session per destination kind. Only `ustream`
//! is implemented; the other kinds stay `NotAvailable` and silently accept
//! any request.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::sink::PublishSink;
use super::state::{BroadcastErrorCode, SessionState, SessionStatus};
use super::{SessionWorker, CLOSE_TIMEOUT};
use crate::registry::slot::FrameReceiver;

/// Broadcast destination kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OuterStreamKind {
    Ustream,
    Twitch,
    Youtube,
}

impl OuterStreamKind {
    pub const ALL: [OuterStreamKind; 3] = [
        OuterStreamKind::Ustream,
        OuterStreamKind::Twitch,
        OuterStreamKind::Youtube,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OuterStreamKind::Ustream => "ustream",
            OuterStreamKind::Twitch => "twitch",
            OuterStreamKind::Youtube => "youtube",
        }
    }

    /// State a fresh session of this kind starts in
    fn initial_state(self) -> SessionState {
        match self {
            OuterStreamKind::Ustream => SessionState::Disabled,
            OuterStreamKind::Twitch | OuterStreamKind::Youtube => SessionState::NotAvailable,
        }
    }
}

impl fmt::Display for OuterStreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OuterStreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ustream" => Ok(OuterStreamKind::Ustream),
            "twitch" => Ok(OuterStreamKind::Twitch),
            "youtube" => Ok(OuterStreamKind::Youtube),
            other => Err(format!("Unsupported stream type <{}>", other)),
        }
    }
}

/// `(http|https|rtmp)://` followed by at least one non-space character
pub fn is_valid_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    matches!(scheme, "http" | "https" | "rtmp")
        && !rest.is_empty()
        && !rest.chars().any(char::is_whitespace)
}

/// One destination's session
#[derive(Debug)]
pub struct BroadcastSession {
    kind: OuterStreamKind,
    url: String,
    status: Arc<SessionStatus>,
    worker: Option<SessionWorker>,
}

impl BroadcastSession {
    pub fn new(kind: OuterStreamKind) -> Self {
        Self {
            kind,
            url: String::new(),
            status: Arc::new(SessionStatus::new(
                kind.initial_state(),
                BroadcastErrorCode::None.code(),
            )),
            worker: None,
        }
    }

    pub fn kind(&self) -> OuterStreamKind {
        self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    /// Current state. A writer that died on its own reports Error.
    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    pub fn error_code(&self) -> BroadcastErrorCode {
        BroadcastErrorCode::from_u8(self.status.error())
    }

    pub fn fail(&self, code: BroadcastErrorCode) {
        tracing::warn!(kind = %self.kind, url = %self.url, reason = code.message(), "Broadcast failed");
        self.status.set(SessionState::Error, code.code());
    }

    /// Start publishing `frames` to `url`. Returns false and leaves the
    /// session in Error when the destination cannot be opened.
    pub async fn init(&mut self, url: &str, frames: FrameReceiver, ffmpeg: Option<&Path>) -> bool {
        self.url = url.to_string();

        if !is_valid_url(url) {
            self.fail(BroadcastErrorCode::Url);
            return false;
        }
        let Some(ffmpeg) = ffmpeg else {
            self.fail(BroadcastErrorCode::CodecNotFound);
            return false;
        };

        self.status
            .set(SessionState::Pending, BroadcastErrorCode::None.code());
        let sink = match PublishSink::spawn(ffmpeg, url).await {
            Ok(sink) => sink,
            Err(e) => {
                tracing::warn!(kind = %self.kind, error = %e, "Cannot start publisher");
                self.fail(BroadcastErrorCode::OpenCodec);
                return false;
            }
        };

        self.worker = Some(SessionWorker::spawn(
            format!("broadcast:{}", self.kind),
            sink,
            frames,
            self.status.clone(),
            BroadcastErrorCode::SendData.code(),
        ));
        tracing::info!(kind = %self.kind, url = %url, "Broadcast started");
        true
    }

    /// Stop publishing. Always ends in Disabled unless the kind is not
    /// available at all.
    pub async fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop(CLOSE_TIMEOUT).await;
            tracing::info!(kind = %self.kind, url = %self.url, "Broadcast stopped");
        }
        if self.state() != SessionState::NotAvailable {
            self.status
                .set(SessionState::Disabled, BroadcastErrorCode::None.code());
        }
    }
}

/// All destination sessions of one device
#[derive(Debug)]
pub struct BroadcastSet {
    sessions: Vec<BroadcastSession>,
}

impl BroadcastSet {
    pub fn new() -> Self {
        Self {
            sessions: OuterStreamKind::ALL
                .iter()
                .map(|k| BroadcastSession::new(*k))
                .collect(),
        }
    }

    pub fn get(&self, kind: OuterStreamKind) -> Option<&BroadcastSession> {
        self.sessions.iter().find(|s| s.kind == kind)
    }

    pub fn get_mut(&mut self, kind: OuterStreamKind) -> Option<&mut BroadcastSession> {
        self.sessions.iter_mut().find(|s| s.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BroadcastSession> {
        self.sessions.iter()
    }

    /// Any session Pending or Running
    pub fn any_active(&self) -> bool {
        self.sessions.iter().any(|s| s.state().is_active())
    }

    pub async fn close_all(&mut self) {
        for session in self.sessions.iter_mut() {
            session.close().await;
        }
    }
}

impl Default for BroadcastSet {
    fn default() -> Self {
        Self::new()
    }
}
