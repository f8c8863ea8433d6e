//! Control request dispatch
//!
//! One request per connection. The handler reads the request line, pulls
//! in the body when the route has one, runs the operation against the
//! registry or the video store, and writes a single response.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Mutex};

use super::dto::{
    parse_lenient, OuterStreamRequest, SetStreamRequest, StreamInfo, VideoInfo,
};
use super::request::{self, PlaybackQuery, Route};
use crate::capture::now_ms;
use crate::config::{ParameterValues, Parameters};
use crate::error::Result;
use crate::playback::PlaybackSession;
use crate::registry::DeviceRegistry;
use crate::server::{response, Connection, ConnectionHandler, StatusCode};
use crate::session::state::RecordingErrorCode;
use crate::session::OuterStreamKind;
use crate::storage::{VideoStore, VIDEO_EXTENSION};

/// Download chunk size
pub const DOWNLOAD_CHUNK: usize = 64_000;

/// Body of the help page
pub const HELP_PAGE: &str = "<html><b>Use the following links to control streaming server</b><br>\
    <ul><li><a href=\"/streams\">Get streams info</a></li>\
    <li><a href=\"/parameters\">Get or set parameters</a></li></ul></html>";

const JSON: &str = "application/json";

/// Control port connection handler
pub struct ControlHandler {
    registry: Arc<DeviceRegistry>,
    store: VideoStore,
    params: Arc<Parameters>,
    ffmpeg: Option<PathBuf>,
    /// Serializes "find device by port, then mutate its broadcasts"
    broadcast_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
    max_line_length: usize,
}

impl ControlHandler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: VideoStore,
        ffmpeg: Option<PathBuf>,
        shutdown: watch::Receiver<bool>,
        read_timeout: Duration,
        max_line_length: usize,
    ) -> Self {
        Self {
            params: Arc::clone(registry.params()),
            registry,
            store,
            ffmpeg,
            broadcast_lock: Mutex::new(()),
            shutdown,
            read_timeout,
            max_line_length,
        }
    }

    async fn send_streams(&self, conn: &mut Connection) -> Result<()> {
        let mut streams = Vec::new();
        for device in self.registry.devices().await {
            streams.push(StreamInfo::from_device(&device).await);
        }
        send_json(conn, &streams).await
    }

    async fn set_parameters(&self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let values: ParameterValues = parse_lenient(body);
        self.params.set(values);
        conn.write_status(StatusCode::Ok, b"", JSON).await
    }

    async fn set_stream(&self, conn: &mut Connection, body: &[u8], request_ts: i64) -> Result<()> {
        let req: SetStreamRequest = parse_lenient(body);
        let Some(device) = self.registry.find_by_port(req.port).await else {
            tracing::warn!(port = req.port, "Recording request for unknown port");
            return send_code(conn, RecordingErrorCode::DeviceNotFound).await;
        };

        if !req.is_recording_active {
            device.stop_recording().await;
            return conn.write_status(StatusCode::Ok, b"", JSON).await;
        }

        match device
            .start_recording(&req.video_id, &self.store, request_ts)
            .await
        {
            Ok(()) => conn.write_status(StatusCode::Ok, b"", JSON).await,
            Err(code) => {
                tracing::warn!(
                    device = %device.name(),
                    video_id = %req.video_id,
                    code = code.code(),
                    "Recording not started"
                );
                send_code(conn, code).await
            }
        }
    }

    async fn set_outer_streams(&self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let req: OuterStreamRequest = parse_lenient(body);
        let Some(entries) = req.streams else {
            let msg = format!("No outer streams send for {}", req.port);
            return send_text(conn, &msg).await;
        };

        let _guard = self.broadcast_lock.lock().await;
        let Some(device) = self.registry.find_by_port(req.port).await else {
            let msg = format!(
                "Error while opening broadcast. No devices with port {} were found.",
                req.port
            );
            tracing::warn!(port = req.port, "Broadcast request for unknown port");
            return send_text(conn, &msg).await;
        };

        let mut plan = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.kind.parse::<OuterStreamKind>() {
                Ok(kind) => plan.push((kind, entry)),
                Err(msg) => {
                    tracing::warn!(port = req.port, kind = %entry.kind, "Unsupported broadcast type");
                    return send_text(conn, &msg).await;
                }
            }
        }

        conn.write_status(StatusCode::Ok, b"", JSON).await?;

        for (kind, entry) in plan {
            let ok = device
                .set_outer_stream(kind, &entry.url, entry.is_active, self.ffmpeg.as_deref())
                .await;
            if !ok {
                tracing::warn!(
                    device = %device.name(),
                    kind = %kind,
                    url = %entry.url,
                    "Broadcast update failed"
                );
                break;
            }
        }
        Ok(())
    }

    async fn playback(&self, conn: &mut Connection, query: &str) -> Result<()> {
        let query = PlaybackQuery::parse(query);
        if query.video_id.is_empty() {
            return send_text(conn, "Bad query parameters").await;
        }
        let Ok(path) = self.store.video_path(&query.video_id) else {
            return send_text(conn, "Bad query parameters").await;
        };
        if !self.store.exists(&query.video_id).await {
            return send_text(conn, &format!("File {} not found.", path.display())).await;
        }

        let session = match PlaybackSession::open(&query.video_id, &path, query.pos, query.speed).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot open recording");
                return send_text(conn, &format!("File {} cannot be played.", path.display())).await;
            }
        };
        session.serve(conn, self.shutdown.clone()).await
    }

    async fn video_info(&self, conn: &mut Connection, video_id: &str) -> Result<()> {
        if self.registry.is_recording(video_id).await {
            return send_json(conn, &VideoInfo { duration: None }).await;
        }
        match self.store.read_duration(video_id).await {
            Ok(duration) => send_json(conn, &VideoInfo { duration: Some(duration) }).await,
            Err(code) => send_code(conn, code).await,
        }
    }

    async fn delete_video(&self, conn: &mut Connection, video_id: &str) -> Result<()> {
        if self.registry.is_recording(video_id).await {
            return send_code(conn, RecordingErrorCode::RecordingIsAlreadyInProcess).await;
        }
        match self.store.delete(video_id).await {
            Ok(()) => conn.write_status(StatusCode::Ok, b"", JSON).await,
            Err(code) => send_code(conn, code).await,
        }
    }

    async fn download(&self, conn: &mut Connection, video_id: &str) -> Result<()> {
        let path = match self.store.video_path(video_id) {
            Ok(path) => path,
            Err(code) => return send_code(conn, code).await,
        };
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Download of missing video");
                return send_code(conn, RecordingErrorCode::VideoNotFound).await;
            }
        };

        let file_name = format!("{}.{}", video_id, VIDEO_EXTENSION);
        conn.write_all(response::download_header(&file_name).as_bytes())
            .await?;

        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let mut total = 0u64;
        loop {
            let n = read_full(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            conn.write_all(&response::chunk(&buf[..n])).await?;
            total += n as u64;
        }
        conn.write_all(&response::chunk(&[])).await?;
        conn.flush().await?;
        tracing::debug!(path = %path.display(), bytes = total, "Video downloaded");
        Ok(())
    }
}

impl ConnectionHandler for ControlHandler {
    async fn handle(&self, mut conn: Connection) -> Result<()> {
        let request_ts = now_ms();
        let line = conn.read_line(self.max_line_length, self.read_timeout).await?;
        let route = Route::parse(&line);
        tracing::debug!(conn_id = conn.id(), route = route.name(), "Control request");

        let body = if route.has_body() {
            request::read_body(&mut conn, self.max_line_length, self.read_timeout).await?
        } else {
            request::skip_headers(&mut conn, self.max_line_length, self.read_timeout).await?;
            bytes::Bytes::new()
        };

        match route {
            Route::Streams => self.send_streams(&mut conn).await,
            Route::GetParameters => send_json(&mut conn, &self.params.get()).await,
            Route::SetParameters => self.set_parameters(&mut conn, &body).await,
            Route::SetStream => self.set_stream(&mut conn, &body, request_ts).await,
            Route::OuterStream => self.set_outer_streams(&mut conn, &body).await,
            Route::Playback(query) => self.playback(&mut conn, &query).await,
            Route::VideoInfo(id) => self.video_info(&mut conn, &id).await,
            Route::DeleteVideo(id) => self.delete_video(&mut conn, &id).await,
            Route::Download(id) => self.download(&mut conn, &id).await,
            Route::Help => {
                conn.write_status(StatusCode::Ok, HELP_PAGE.as_bytes(), "text/html")
                    .await
            }
        }
    }

    fn cleanup(&self) {
        tracing::debug!("Control listener closed");
    }
}

async fn send_json<T: serde::Serialize>(conn: &mut Connection, value: &T) -> Result<()> {
    match serde_json::to_vec(value) {
        Ok(body) => conn.write_status(StatusCode::Ok, &body, JSON).await,
        Err(e) => {
            tracing::error!(error = %e, "Cannot encode response");
            conn.write_status(StatusCode::InternalServerError, b"", JSON)
                .await
        }
    }
}

/// 400 with the numeric error code as body
async fn send_code(conn: &mut Connection, code: RecordingErrorCode) -> Result<()> {
    conn.write_status(StatusCode::BadRequest, code.code().to_string().as_bytes(), JSON)
        .await
}

/// 400 with a textual reason
async fn send_text(conn: &mut Connection, msg: &str) -> Result<()> {
    conn.write_status(StatusCode::BadRequest, msg.as_bytes(), JSON)
        .await
}

/// Fill `buf` unless the file ends first
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
