//! HTTP/2 frame types and utilities
//!
//! This module defines the frame vocabulary specified in RFC 9113 Section 6:
//! the nine-byte frame header, frame types and flags, and typed views over
//! the fixed-layout control frame payloads.

use super::error::{Error, Result};
use super::FRAME_HEADER_LEN;
use bytes::{Buf, BufMut, Bytes};
use std::fmt;

/// HTTP/2 frame types (RFC 9113 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA frame (0x0) - Conveys arbitrary, variable-length sequences of octets
    Data = 0x0,
    /// HEADERS frame (0x1) - Opens a stream and carries header block fragment
    Headers = 0x1,
    /// PRIORITY frame (0x2) - Specifies sender-advised priority of a stream
    Priority = 0x2,
    /// RST_STREAM frame (0x3) - Allows immediate termination of a stream
    RstStream = 0x3,
    /// SETTINGS frame (0x4) - Conveys configuration parameters
    Settings = 0x4,
    /// PUSH_PROMISE frame (0x5) - Used to notify peer of intent to initiate stream
    PushPromise = 0x5,
    /// PING frame (0x6) - Mechanism for measuring round-trip time
    Ping = 0x6,
    /// GOAWAY frame (0x7) - Initiates shutdown of connection
    Goaway = 0x7,
    /// WINDOW_UPDATE frame (0x8) - Implements flow control
    WindowUpdate = 0x8,
    /// CONTINUATION frame (0x9) - Continues sequence of header block fragments
    Continuation = 0x9,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }

    /// Whether frames of this type must carry stream id 0
    pub fn is_connection_only(&self) -> bool {
        matches!(self, FrameType::Settings | FrameType::Ping | FrameType::Goaway)
    }

    /// Whether frames of this type must carry a non-zero stream id
    pub fn is_stream_only(&self) -> bool {
        matches!(
            self,
            FrameType::Data
                | FrameType::Headers
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::PushPromise
                | FrameType::Continuation
        )
    }

    /// Small fixed-layout frames read through the codec's scratch buffer
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            FrameType::Settings
                | FrameType::Ping
                | FrameType::WindowUpdate
                | FrameType::RstStream
                | FrameType::Priority
                | FrameType::Goaway
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Create empty flags
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Create from u8
    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    /// Get raw u8 value
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set a flag
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Return a copy with `flag` added
    pub fn with(mut self, flag: u8) -> Self {
        self.set(flag);
        self
    }

    /// Check if a flag is set
    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    // Common flags

    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;

    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;

    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;

    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;

    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    /// Check if END_STREAM is set
    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    /// Check if ACK is set
    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    /// Check if END_HEADERS is set
    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    /// Check if PADDED is set
    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    /// Check if PRIORITY is set
    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// The fixed nine-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (24 bits)
    pub length: u32,
    /// Raw frame type; unknown types are preserved so they can be skipped
    pub frame_type: u8,
    /// Frame flags
    pub flags: FrameFlags,
    /// Stream identifier with the reserved bit cleared
    pub stream_id: u32,
}

impl FrameHeader {
    /// Create a header for a known frame type
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: u32) -> Self {
        FrameHeader {
            length,
            frame_type: frame_type.as_u8(),
            flags,
            stream_id,
        }
    }

    /// Known frame type, if any
    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    /// Decode from exactly nine bytes
    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let length = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7FFF_FFFF;
        FrameHeader {
            length,
            frame_type: buf[3],
            flags: FrameFlags::from_u8(buf[4]),
            stream_id,
        }
    }

    /// Append the big-endian encoding to `dst`
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_uint(u64::from(self.length & 0x00FF_FFFF), 3);
        dst.put_u8(self.frame_type);
        dst.put_u8(self.flags.as_u8());
        dst.put_u32(self.stream_id & 0x7FFF_FFFF);
    }
}

/// A decoded frame with padding and priority fields already stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Frame flags
    pub flags: FrameFlags,
    /// Stream ID
    pub stream_id: u32,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }
    }

    /// Get payload size
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    fn expect_len(&self, len: usize) -> Result<()> {
        if self.payload.len() != len {
            return Err(Error::FrameSize(format!(
                "{} payload must be {} bytes, got {}",
                self.frame_type,
                len,
                self.payload.len()
            )));
        }
        Ok(())
    }

    /// SETTINGS parameters as `(identifier, value)` pairs in wire order
    pub fn settings(&self) -> Result<Vec<(u16, u32)>> {
        if self.payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                self.payload.len()
            )));
        }
        let mut buf = self.payload.clone();
        let mut params = Vec::with_capacity(buf.len() / 6);
        while buf.has_remaining() {
            params.push((buf.get_u16(), buf.get_u32()));
        }
        Ok(params)
    }

    /// WINDOW_UPDATE increment with the reserved bit cleared
    pub fn window_increment(&self) -> Result<u32> {
        self.expect_len(4)?;
        Ok(self.payload.clone().get_u32() & 0x7FFF_FFFF)
    }

    /// RST_STREAM error code
    pub fn rst_error_code(&self) -> Result<u32> {
        self.expect_len(4)?;
        Ok(self.payload.clone().get_u32())
    }

    /// PING opaque data
    pub fn ping_data(&self) -> Result<[u8; 8]> {
        self.expect_len(8)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(&self.payload);
        Ok(data)
    }

    /// GOAWAY fields
    pub fn goaway(&self) -> Result<GoawayFrame> {
        if self.payload.len() < 8 {
            return Err(Error::FrameSize(format!(
                "GOAWAY payload must be at least 8 bytes, got {}",
                self.payload.len()
            )));
        }
        let mut buf = self.payload.clone();
        let last_stream_id = buf.get_u32() & 0x7FFF_FFFF;
        let error_code = buf.get_u32();
        Ok(GoawayFrame {
            last_stream_id,
            error_code,
            debug_data: buf,
        })
    }
}

/// GOAWAY frame (RFC 9113 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Last stream ID the sender processed
    pub last_stream_id: u32,
    /// Raw error code, possibly outside the registry
    pub error_code: u32,
    /// Debug data
    pub debug_data: Bytes,
}

impl GoawayFrame {
    /// Debug data rendered lossily as text
    pub fn debug_text(&self) -> String {
        String::from_utf8_lossy(&self.debug_data).into_owned()
    }
}
