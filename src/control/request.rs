//! Control request parsing
//!
//! Requests are recognized by searching the request line for a fixed set of
//! method and path prefixes, in order. Body-bearing requests carry raw JSON
//! whose size comes from `Content-Length`.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, ProtocolError, Result};
use crate::playback::clamp_speed;
use crate::server::Connection;

/// Largest request body we accept
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Header lines read before giving up on the blank line
const MAX_HEADER_LINES: usize = 100;

const CONTENT_LENGTH: &str = "content-length:";

/// Operation selected by the request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /streams`
    Streams,
    /// `PUT /stream`
    SetStream,
    /// `GET /parameters`
    GetParameters,
    /// `PUT /parameters`
    SetParameters,
    /// `POST /outerstream`
    OuterStream,
    /// `GET /playback?<query>`
    Playback(String),
    /// `GET /video/<id>`
    VideoInfo(String),
    /// `DELETE /video/<id>`
    DeleteVideo(String),
    /// `GET /download/<id>`
    Download(String),
    /// Anything else
    Help,
}

impl Route {
    /// Match a request line. The first pattern found anywhere in the line
    /// wins, so `PUT /streams` still selects [`Route::SetStream`].
    pub fn parse(line: &str) -> Route {
        if line.contains("GET /streams") {
            Route::Streams
        } else if line.contains("PUT /stream") {
            Route::SetStream
        } else if line.contains("GET /parameters") {
            Route::GetParameters
        } else if line.contains("PUT /parameters") {
            Route::SetParameters
        } else if line.contains("POST /outerstream") {
            Route::OuterStream
        } else if line.contains("GET /playback") {
            Route::Playback(path_param(line, "playback?"))
        } else if line.contains("GET /video/") {
            Route::VideoInfo(path_param(line, "video/"))
        } else if line.contains("DELETE /video/") {
            Route::DeleteVideo(path_param(line, "video/"))
        } else if line.contains("GET /download/") {
            Route::Download(path_param(line, "download/"))
        } else {
            Route::Help
        }
    }

    /// True for requests whose JSON body must be read
    pub fn has_body(&self) -> bool {
        matches!(
            self,
            Route::SetStream | Route::SetParameters | Route::OuterStream
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Route::Streams => "streams",
            Route::SetStream => "set_stream",
            Route::GetParameters => "get_parameters",
            Route::SetParameters => "set_parameters",
            Route::OuterStream => "outer_stream",
            Route::Playback(_) => "playback",
            Route::VideoInfo(_) => "video_info",
            Route::DeleteVideo(_) => "delete_video",
            Route::Download(_) => "download",
            Route::Help => "help",
        }
    }
}

/// Text after `marker` up to the protocol version
fn path_param(line: &str, marker: &str) -> String {
    let Some(start) = line.find(marker) else {
        return String::new();
    };
    let rest = &line[start + marker.len()..];
    rest.split_whitespace().next().unwrap_or_default().to_string()
}

/// `Content-Length` value of one header line, if it is that header
fn content_length(line: &str) -> Option<Result<usize>> {
    let name = line.get(..CONTENT_LENGTH.len())?;
    let value = line.get(CONTENT_LENGTH.len()..)?;
    if !name.eq_ignore_ascii_case(CONTENT_LENGTH) {
        return None;
    }
    let value = value.trim();
    Some(
        value
            .parse::<usize>()
            .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()).into()),
    )
}

/// Read headers up to the blank line, then exactly `Content-Length` body
/// bytes. A missing, zero or malformed length is an error and the caller
/// drops the connection without answering.
pub async fn read_body<S>(
    conn: &mut Connection<S>,
    max_line: usize,
    timeout: Duration,
) -> Result<Bytes>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let mut length = None;
    for _ in 0..MAX_HEADER_LINES {
        let line = conn.read_line(max_line, timeout).await?;
        if line.is_empty() {
            break;
        }
        if let Some(value) = content_length(&line) {
            length = Some(value?);
        }
    }

    let length = match length {
        None => return Err(ProtocolError::MissingContentLength.into()),
        Some(0) => return Err(ProtocolError::InvalidContentLength("0".into()).into()),
        Some(n) if n > MAX_BODY_SIZE => return Err(ProtocolError::BodyTooLarge(n).into()),
        Some(n) => n,
    };

    let body = conn.read_exact(length, timeout).await?;
    if body.len() < length {
        return Err(ProtocolError::IncompleteBody {
            expected: length,
            actual: body.len(),
        }
        .into());
    }
    Ok(body)
}

/// Drain the header block of a body-less request. The client may send
/// nothing more, so a timeout or close simply ends the drain.
pub async fn skip_headers<S>(conn: &mut Connection<S>, max_line: usize, timeout: Duration) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    for _ in 0..MAX_HEADER_LINES {
        match conn.read_line(max_line, timeout).await {
            Ok(line) if line.is_empty() => return Ok(()),
            Ok(_) => {}
            Err(Error::Timeout) | Err(Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Parsed `GET /playback` query
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackQuery {
    pub video_id: String,
    /// Start offset into the recording, ms
    pub pos: i64,
    /// Playback speed multiplier
    pub speed: f64,
}

impl PlaybackQuery {
    /// Parse `video_id=..&pos=..&speed=..`. Unknown keys are ignored, a
    /// malformed or negative `pos` is 0, a malformed or non-positive `speed`
    /// is 1 and speeds above [`MAX_SPEED`](crate::playback::MAX_SPEED) are capped.
    pub fn parse(query: &str) -> Self {
        let mut parsed = Self {
            video_id: String::new(),
            pos: 0,
            speed: 1.0,
        };
        for item in query.split('&') {
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            match key {
                "video_id" => parsed.video_id = value.to_string(),
                "pos" => parsed.pos = value.parse::<i64>().unwrap_or(0).max(0),
                "speed" => parsed.speed = value.parse::<f64>().map_or(1.0, clamp_speed),
                _ => {}
            }
        }
        parsed
    }
}
