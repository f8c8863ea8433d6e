//! Minimal HTTP/1.0 response encoding
//!
//! Only the shapes the control and live-stream ports actually send are
//! produced: status responses with a body, the multipart MJPEG stream, and a
//! chunked file download.

use bytes::{BufMut, BytesMut};

/// `Server` header value
pub const SERVER_NAME: &str = "vstreamer_server";

/// Multipart boundary of the MJPEG stream
pub const BOUNDARY: &str = "boundarydonotcross";

/// Status codes the servers use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    InternalServerError = 500,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// Status line, headers and body. Error statuses are always `text/plain`.
pub fn status_response(code: StatusCode, body: &[u8], content_type: &str) -> BytesMut {
    let content_type = match code {
        StatusCode::Ok => content_type,
        _ => "text/plain",
    };
    let mut buf = BytesMut::with_capacity(256 + body.len());
    put_str(
        &mut buf,
        &format!(
            "HTTP/1.0 {} {}\r\n\
             Content-type: {}\r\n\
             Connection: close\r\n\
             Server: {}\r\n\
             Cache-Control: no-cache\r\n\
             Pragma: no-cache\r\n\
             Content-Length: {}\r\n\
             \r\n",
            code.as_u16(),
            code.reason(),
            content_type,
            SERVER_NAME,
            body.len()
        ),
    );
    buf.put_slice(body);
    buf
}

/// Response header that opens a multipart MJPEG stream, plus the first
/// boundary
pub fn mjpeg_preamble() -> String {
    format!(
        "HTTP/1.0 200 OK\r\n\
         Connection: close\r\n\
         Server: {server}\r\n\
         Cache-Control: no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0\r\n\
         Pragma: no-cache\r\n\
         Content-Type: multipart/x-mixed-replace;boundary={boundary}\r\n\
         \r\n\
         --{boundary}\r\n",
        server = SERVER_NAME,
        boundary = BOUNDARY
    )
}

/// One multipart part: headers, the JPEG, and the closing boundary
pub fn mjpeg_part(image: &[u8], timestamp_ms: i64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + image.len());
    put_str(
        &mut buf,
        &format!(
            "Content-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {:.6}\r\n\r\n",
            image.len(),
            timestamp_ms as f64 / 1000.0
        ),
    );
    buf.put_slice(image);
    put_str(&mut buf, &format!("\r\n--{}\r\n", BOUNDARY));
    buf
}

/// Header of a chunked binary download
pub fn download_header(file_name: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: binary/octet-stream\r\n\
         Content-Disposition: attachment; filename=\"{}\"\r\n\
         Connection: close\r\n\
         Server: {}\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n",
        file_name, SERVER_NAME
    )
}

/// One transfer-encoding chunk; an empty slice encodes the final chunk
pub fn chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    put_str(&mut buf, &format!("{:x}\r\n", data.len()));
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
}
