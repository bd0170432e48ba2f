//! HTTP/2 stream state
//!
//! This module implements the client side of the stream state machine from
//! RFC 9113 Section 5.1, packed together with the response read progress
//! into a single atomic word.
//!
//! The reader loop and the thread consuming a response both move the state
//! forward, so every transition is a compare-and-swap over the whole word.
//!
//! Bit layout:
//!
//! ```text
//! [0-9]   status code (0 = not yet received)
//! [10]    final response headers received
//! [11]    END_STREAM received
//! [12]    END_STREAM sent
//! [13-15] read state
//! [16-19] stream state
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stream ID type
pub type StreamId = u32;

const MASK_STATUS: u32 = 0x3FF;
const FLAG_HEADERS_RECEIVED: u32 = 1 << 10;
const FLAG_END_STREAM_RECEIVED: u32 = 1 << 11;
const FLAG_END_STREAM_SENT: u32 = 1 << 12;
const SHIFT_READ_STATE: u32 = 13;
const MASK_READ_STATE: u32 = 0x7 << SHIFT_READ_STATE;
const SHIFT_STREAM_STATE: u32 = 16;
const MASK_STREAM_STATE: u32 = 0xF << SHIFT_STREAM_STATE;

/// Stream state as defined in RFC 9113 Section 5.1
///
/// Push is disabled, so the reserved states never occur on a client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: HEADERS not yet sent
    Idle = 0,
    /// Open: Both sides can send frames
    Open = 1,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal = 2,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote = 3,
    /// Closed: Stream is closed
    Closed = 4,
}

impl StreamState {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => StreamState::Idle,
            1 => StreamState::Open,
            2 => StreamState::HalfClosedLocal,
            3 => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        }
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }

    /// State after END_STREAM in the given direction, if it changes
    fn after_end_stream(self, received: bool) -> Option<StreamState> {
        match (self, received) {
            (StreamState::Open, true) => Some(StreamState::HalfClosedRemote),
            (StreamState::HalfClosedLocal, true) => Some(StreamState::Closed),
            (StreamState::Open, false) => Some(StreamState::HalfClosedLocal),
            (StreamState::HalfClosedRemote, false) => Some(StreamState::Closed),
            _ => None,
        }
    }
}

/// Progress of the response as seen by its consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for final response headers
    Waiting = 0,
    /// Headers received, body being read
    Reading = 1,
    /// Response complete
    Done = 2,
    /// Failed; the exchange holds the error
    Error = 3,
}

impl ReadState {
    /// Done and Error are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadState::Done | ReadState::Error)
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => ReadState::Waiting,
            1 => ReadState::Reading,
            2 => ReadState::Done,
            _ => ReadState::Error,
        }
    }
}

fn with_read_state(word: u32, state: ReadState) -> u32 {
    (word & !MASK_READ_STATE) | ((state as u32) << SHIFT_READ_STATE)
}

fn read_state_of(word: u32) -> ReadState {
    ReadState::from_bits((word & MASK_READ_STATE) >> SHIFT_READ_STATE)
}

fn with_stream_state(word: u32, state: StreamState) -> u32 {
    (word & !MASK_STREAM_STATE) | ((state as u32) << SHIFT_STREAM_STATE)
}

/// Atomic packed stream and read state
pub struct PackedStreamState {
    word: AtomicU32,
}

impl PackedStreamState {
    /// Idle stream, waiting for headers, no flags, no status
    pub fn new() -> Self {
        PackedStreamState {
            word: AtomicU32::new(0),
        }
    }

    fn load(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    fn update<F>(&self, mut f: F)
    where
        F: FnMut(u32) -> Option<u32>,
    {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| f(word));
    }

    pub fn read_state(&self) -> ReadState {
        read_state_of(self.load())
    }

    pub fn stream_state(&self) -> StreamState {
        StreamState::from_bits((self.load() & MASK_STREAM_STATE) >> SHIFT_STREAM_STATE)
    }

    /// Final (non-1xx) response headers have arrived
    pub fn headers_received(&self) -> bool {
        self.load() & FLAG_HEADERS_RECEIVED != 0
    }

    pub fn end_stream_received(&self) -> bool {
        self.load() & FLAG_END_STREAM_RECEIVED != 0
    }

    pub fn end_stream_sent(&self) -> bool {
        self.load() & FLAG_END_STREAM_SENT != 0
    }

    /// Response status, if final headers have arrived
    pub fn status(&self) -> Option<u16> {
        match self.load() & MASK_STATUS {
            0 => None,
            code => Some(code as u16),
        }
    }

    /// Record final response headers
    ///
    /// Stores the status, sets the headers flag and moves the read state
    /// from Waiting to Reading.
    pub fn set_response_headers_received(&self, status: u16) {
        self.update(|word| {
            let mut next = (word & !MASK_STATUS) | (u32::from(status) & MASK_STATUS);
            next |= FLAG_HEADERS_RECEIVED;
            if read_state_of(word) == ReadState::Waiting {
                next = with_read_state(next, ReadState::Reading);
            }
            Some(next)
        });
    }

    /// END_STREAM arrived: read state Done unless already failed, stream
    /// state advances
    pub fn mark_end_stream_received(&self) {
        self.update(|word| {
            let mut next = word | FLAG_END_STREAM_RECEIVED;
            if !read_state_of(word).is_terminal() {
                next = with_read_state(next, ReadState::Done);
            }
            let current = StreamState::from_bits((word & MASK_STREAM_STATE) >> SHIFT_STREAM_STATE);
            if let Some(state) = current.after_end_stream(true) {
                next = with_stream_state(next, state);
            }
            Some(next)
        });
    }

    /// END_STREAM was written; idempotent
    pub fn mark_end_stream_sent(&self) {
        self.update(|word| {
            if word & FLAG_END_STREAM_SENT != 0 {
                return None;
            }
            let mut next = word | FLAG_END_STREAM_SENT;
            let current = StreamState::from_bits((word & MASK_STREAM_STATE) >> SHIFT_STREAM_STATE);
            if let Some(state) = current.after_end_stream(false) {
                next = with_stream_state(next, state);
            }
            Some(next)
        });
    }

    /// Finish reading; no effect once the read state is terminal
    pub fn set_read_state_done(&self) {
        self.update(|word| {
            if read_state_of(word).is_terminal() {
                return None;
            }
            Some(with_read_state(word, ReadState::Done))
        });
    }

    /// Signal failure to the consumer without touching the protocol state
    ///
    /// No effect once the read state is terminal.
    pub fn set_error_state(&self) {
        self.update(|word| {
            if read_state_of(word).is_terminal() {
                return None;
            }
            Some(with_read_state(word | FLAG_END_STREAM_RECEIVED, ReadState::Error))
        });
    }

    /// HEADERS is being written: Open, or HalfClosedLocal with END_STREAM
    pub fn on_headers_encoded(&self, end_stream: bool) {
        self.update(|word| {
            if end_stream {
                Some(with_stream_state(
                    word | FLAG_END_STREAM_SENT,
                    StreamState::HalfClosedLocal,
                ))
            } else {
                Some(with_stream_state(word, StreamState::Open))
            }
        });
    }
}

impl Default for PackedStreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PackedStreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedStreamState")
            .field("stream_state", &self.stream_state())
            .field("read_state", &self.read_state())
            .field("status", &self.status())
            .field("end_stream_sent", &self.end_stream_sent())
            .field("end_stream_received", &self.end_stream_received())
            .finish()
    }
}
