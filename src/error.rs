//! Error types for vstreamer
//!
//! Library code returns [`Result<T>`] everywhere. Transport and protocol
//! errors abort the connection they occurred on; capture errors are counted
//! by the capture loop; bind and config errors surface at construction.

use std::fmt;
use std::io;

/// Result type alias using vstreamer's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug)]
pub enum Error {
    /// I/O error (socket, file)
    Io(io::Error),
    /// No listening socket could be bound on the port
    Bind { port: u16 },
    /// Invalid or unreadable configuration
    Config(String),
    /// Malformed control or stream request
    Protocol(ProtocolError),
    /// Codec adapter failure
    Capture(CaptureError),
    /// Read did not complete in time
    Timeout,
    /// Peer closed the connection
    ConnectionClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Bind { port } => write!(f, "Could not bind any address on port {}", port),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Capture(e) => write!(f, "Capture error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Capture(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<CaptureError> for Error {
    fn from(err: CaptureError) -> Self {
        Error::Capture(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Request parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line exceeded the reader's limit before CRLF
    LineTooLong(usize),
    /// Request line could not be split into method and target
    InvalidRequestLine(String),
    /// Body-bearing request without a Content-Length header
    MissingContentLength,
    /// Content-Length present but not a number
    InvalidContentLength(String),
    /// Body shorter than announced
    IncompleteBody { expected: usize, actual: usize },
    /// Declared body exceeds what we are willing to buffer
    BodyTooLarge(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::LineTooLong(max) => write!(f, "Line exceeds {} bytes", max),
            ProtocolError::InvalidRequestLine(line) => write!(f, "Invalid request line: {}", line),
            ProtocolError::MissingContentLength => write!(f, "Missing Content-Length"),
            ProtocolError::InvalidContentLength(v) => write!(f, "Invalid Content-Length: {}", v),
            ProtocolError::IncompleteBody { expected, actual } => {
                write!(f, "Incomplete body: expected {} bytes, got {}", expected, actual)
            }
            ProtocolError::BodyTooLarge(size) => write!(f, "Body too large: {} bytes", size),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Codec adapter errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Required external tool is not installed
    ToolNotFound(&'static str),
    /// Device could not be opened
    Open(String),
    /// Reading a frame failed
    Read(String),
    /// No frame arrived within the frame timeout
    Timeout,
    /// Input ended (expected for files)
    EndOfStream,
    /// The handle does not support this operation
    Unsupported(&'static str),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::ToolNotFound(tool) => write!(f, "{} not found", tool),
            CaptureError::Open(msg) => write!(f, "Cannot open device: {}", msg),
            CaptureError::Read(msg) => write!(f, "Cannot read frame: {}", msg),
            CaptureError::Timeout => write!(f, "Frame timeout"),
            CaptureError::EndOfStream => write!(f, "End of stream"),
            CaptureError::Unsupported(op) => write!(f, "Unsupported operation: {}", op),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<io::Error> for CaptureError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CaptureError::EndOfStream
        } else {
            CaptureError::Read(err.to_string())
        }
    }
}
