//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 9113 Section 7.
//!
//! Errors are `Clone` because one terminal cause (a dead socket, a GOAWAY,
//! a connection-level protocol violation) is handed to every exchange that
//! was open on the connection.

use std::fmt;
use std::io;
use std::sync::Arc;

/// HTTP/2 errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// I/O error on the underlying session
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Error from the request model or transport layer
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    /// Connection-level protocol error (PROTOCOL_ERROR)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stream-level protocol error, reset with PROTOCOL_ERROR
    #[error("Protocol error on stream {stream_id}: {reason}")]
    StreamProtocol { stream_id: u32, reason: String },

    /// Connection flow control violated (FLOW_CONTROL_ERROR)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Stream flow control violated, reset with FLOW_CONTROL_ERROR
    #[error("Flow control error on stream {stream_id}: {reason}")]
    StreamFlowControl { stream_id: u32, reason: String },

    /// Peer did not send SETTINGS in time during the handshake
    #[error("Settings timeout")]
    SettingsTimeout,

    /// Frame size error (FRAME_SIZE_ERROR)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Header block could not be decoded (COMPRESSION_ERROR)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Peer reset the stream
    #[error("Stream {stream_id} reset by peer: {}", ErrorCode::name_of(*.code))]
    StreamReset { stream_id: u32, code: u32 },

    /// Stream was above the peer's GOAWAY last-stream-id and never processed
    #[error("Stream {stream_id} refused: GOAWAY last stream {last_stream_id}, {}", ErrorCode::name_of(*.code))]
    RefusedStream {
        stream_id: u32,
        last_stream_id: u32,
        code: u32,
    },

    /// Peer closed the connection with a GOAWAY carrying an error
    #[error("Connection closed by peer GOAWAY: {} {debug}", ErrorCode::name_of(*.code))]
    GoAway { last_stream_id: u32, code: u32, debug: String },

    /// No response data arrived within the read timeout
    #[error("Read timeout on stream {stream_id}")]
    ReadTimeout { stream_id: u32 },

    /// Stream write could not get flow-control credit within the write timeout
    #[error("Write timeout on stream {stream_id}")]
    WriteTimeout { stream_id: u32 },

    /// Queued frames sat unwritten past the write timeout
    #[error("Connection writer stalled for {waited_ms} ms")]
    WriterStalled { waited_ms: u64 },

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection no longer admits new streams
    #[error("Connection not accepting new streams: {0}")]
    NotAccepting(String),

    /// Peer's concurrent stream limit reached
    #[error("Too many concurrent streams: {active} of {limit}")]
    TooManyStreams { active: u32, limit: u32 },

    /// Response body length disagrees with its content-length header
    #[error("Content-Length mismatch on stream {stream_id}: expected {expected}, received {received}")]
    ContentLengthMismatch {
        stream_id: u32,
        expected: u64,
        received: u64,
    },

    /// Encoded request header list exceeds the peer's limit
    #[error("Header list size {size} exceeds peer limit {limit}")]
    HeaderListTooLarge { size: usize, limit: u32 },

    /// Stream was cancelled locally
    #[error("Stream cancelled: {0}")]
    Cancelled(u32),

    /// Operation on a stream that is already closed
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Internal invariant failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Error code to place in RST_STREAM or GOAWAY for this error
    pub fn code(&self) -> u32 {
        let code = match self {
            Error::Protocol(_)
            | Error::StreamProtocol { .. }
            | Error::ContentLengthMismatch { .. } => ErrorCode::ProtocolError,
            Error::FlowControl(_) | Error::StreamFlowControl { .. } => ErrorCode::FlowControlError,
            Error::SettingsTimeout => ErrorCode::SettingsTimeout,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::StreamReset { code, .. } | Error::GoAway { code, .. } => return *code,
            Error::RefusedStream { .. } => ErrorCode::RefusedStream,
            Error::ReadTimeout { .. } | Error::WriteTimeout { .. } | Error::Cancelled(_) => {
                ErrorCode::Cancel
            }
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::ConnectionClosed => ErrorCode::NoError,
            Error::WriterStalled { .. } => ErrorCode::InternalError,
            Error::Io(_)
            | Error::Http(_)
            | Error::NotAccepting(_)
            | Error::TooManyStreams { .. }
            | Error::HeaderListTooLarge { .. }
            | Error::Internal(_) => ErrorCode::InternalError,
        };
        code.as_u32()
    }

    /// Whether this is a timeout rather than a protocol failure
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::SettingsTimeout
                | Error::ReadTimeout { .. }
                | Error::WriteTimeout { .. }
                | Error::WriterStalled { .. }
        )
    }

    /// Whether the request was never processed and may be sent again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RefusedStream { .. }
            | Error::NotAccepting(_)
            | Error::TooManyStreams { .. } => true,
            Error::StreamReset { code, .. } => *code == ErrorCode::RefusedStream.as_u32(),
            _ => false,
        }
    }

    /// Whether the error tears down the whole connection
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Protocol(_)
            | Error::FlowControl(_)
            | Error::SettingsTimeout
            | Error::FrameSize(_)
            | Error::Compression(_)
            | Error::GoAway { .. }
            | Error::ConnectionClosed
            | Error::WriterStalled { .. }
            | Error::Internal(_) => true,
            _ => false,
        }
    }

    /// Whether this wraps a socket read/write timeout
    pub fn is_io_timeout(&self) -> bool {
        matches!(self, Error::Io(e) if crate::http::session::is_timeout(e))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(e) => e.kind(),
            e if e.is_timeout() => io::ErrorKind::TimedOut,
            Error::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            Error::StreamReset { .. } | Error::Cancelled(_) => io::ErrorKind::ConnectionReset,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// HTTP/2 error codes as defined in RFC 9113 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }

    /// Render a raw wire code, including codes outside the registry
    pub fn name_of(code: u32) -> String {
        match ErrorCode::from_u32(code) {
            Some(known) => known.to_string(),
            None => format!("UNKNOWN (0x{:x})", code),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
