//! Per-connection byte reader and writer
//!
//! Reads go through a small internal buffer. `read_line` treats a timeout as
//! failure; `read_exact` returns whatever arrived before the deadline. Any
//! error means the caller should drop the connection.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{Error, ProtocolError, Result};
use crate::server::response::{self, StatusCode};

/// Size of a single socket read
const IO_BUFFER: usize = 256;

/// One accepted client
pub struct Connection<S = TcpStream> {
    id: u64,
    peer: Option<SocketAddr>,
    stream: S,
    buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: u64, stream: S, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            stream,
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Pull one read's worth of bytes into the buffer. Returns 0 at EOF.
    async fn fill(&mut self) -> Result<usize> {
        self.buf.reserve(IO_BUFFER);
        let n = self.stream.read_buf(&mut self.buf).await?;
        Ok(n)
    }

    /// Read one line without its terminator. CRLF and bare LF both end a
    /// line. Timeout, EOF and over-long lines are errors.
    pub async fn read_line(&mut self, max_len: usize, timeout: Duration) -> Result<String> {
        tokio::time::timeout(timeout, self.read_line_inner(max_len))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn read_line_inner(&mut self, max_len: usize) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                if line.len() > max_len {
                    return Err(ProtocolError::LineTooLong(max_len).into());
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > max_len {
                return Err(ProtocolError::LineTooLong(max_len).into());
            }
            if self.fill().await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Read up to `n` bytes. Returns early with a partial result when the
    /// timeout expires or the peer closes.
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        while self.buf.len() < n {
            match tokio::time::timeout_at(deadline, self.fill()).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }
        }
        let take = n.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }

    /// Discard buffered input
    pub fn clear_input(&mut self) {
        self.buf.advance(self.buf.len());
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Write a complete status response
    pub async fn write_status(
        &mut self,
        code: StatusCode,
        body: &[u8],
        content_type: &str,
    ) -> Result<()> {
        let resp = response::status_response(code, body, content_type);
        self.stream.write_all(&resp).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_read_lines() {
        let mock = tokio_test::io::Builder::new()
            .read(b"GET /streams HTTP/1.0\r\nHost: x")
            .read(b"\r\n\nrest")
            .build();
        let mut conn = Connection::new(1, mock, None);
        let t = Duration::from_secs(1);

        assert_eq!(conn.read_line(1024, t).await.unwrap(), "GET /streams HTTP/1.0");
        assert_eq!(conn.read_line(1024, t).await.unwrap(), "Host: x");
        assert_eq!(conn.read_line(1024, t).await.unwrap(), "");
        assert_eq!(&conn.read_exact(4, t).await.unwrap()[..], b"rest");
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mock = tokio_test::io::Builder::new().read(&[b'a'; 64]).build();
        let mut conn = Connection::new(1, mock, None);

        let err = conn.read_line(16, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::LineTooLong(16))));
    }

    #[tokio::test]
    async fn test_read_line_times_out() {
        let (client, server) = duplex(64);
        let mut conn = Connection::new(1, server, None);

        let err = conn
            .read_line(1024, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        drop(client);
    }

    #[tokio::test]
    async fn test_read_exact_returns_partial_on_timeout() {
        let (mut client, server) = duplex(64);
        let mut conn = Connection::new(1, server, None);

        client.write_all(b"{\"a\"").await.unwrap();
        let body = conn.read_exact(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(&body[..], b"{\"a\"");
    }

    #[tokio::test]
    async fn test_eof_aborts_line() {
        let (client, server) = duplex(64);
        drop(client);
        let mut conn = Connection::new(1, server, None);

        let err = conn.read_line(1024, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_write_status() {
        let (mut client, server) = duplex(1024);
        let mut conn = Connection::new(1, server, None);

        conn.write_status(StatusCode::Ok, b"{}", "application/json")
            .await
            .unwrap();
        drop(conn);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK"));
        assert!(text.ends_with("{}"));
    }
}
