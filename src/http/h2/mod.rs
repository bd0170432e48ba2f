//! HTTP/2 client connection engine
//!
//! This module implements multiplexed HTTP/2 client connections over a single
//! already-established byte stream (plain TCP with prior knowledge, or TLS
//! after ALPN selected `h2`).
//!
//! # Architecture
//!
//! Each connection runs exactly two background threads:
//!
//! - the **reader loop** (`connection.rs`) parses frames from the session and
//!   dispatches them to exchanges or to connection-level handling. It owns the
//!   HPACK decoder so dynamic-table updates follow wire order.
//! - the **writer loop** (`muxer.rs`) drains a queue of typed work items and
//!   serializes every outbound frame. It owns the HPACK encoder and assigns
//!   stream ids in the order HEADERS are written.
//!
//! Callers drive an `Exchange` per request. Body writes are split into
//! flow-controlled DATA chunks queued on the exchange; body reads drain chunks
//! the reader loop delivered.
//!
//! ## Features
//!
//! - **Frame handling**: all ten RFC 9113 frame types, CONTINUATION assembly,
//!   padding and priority stripping
//! - **Flow control**: connection and stream send windows, receive windows
//!   replenished at one third of the initial window
//! - **Stream multiplexing**: admission bounded by the peer's
//!   MAX_CONCURRENT_STREAMS, direct-indexed stream registry
//! - **GOAWAY**: graceful drain of streams below the peer's last stream id
//! - **Timeouts**: tick-based read timeouts swept by the writer loop
//!
//! # Examples
//!
//! ```no_run
//! use h2mux::http::h2::ConnectionBuilder;
//! use h2mux::http::{HttpRequest, Method};
//! use std::io::Read;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let connection = ConnectionBuilder::new()
//!     .initial_window_size(1 << 20)
//!     .connect(stream)
//!     .unwrap();
//!
//! let request = HttpRequest::builder()
//!     .method(Method::Post)
//!     .uri("http://127.0.0.1:8080/upload")
//!     .body("hello")
//!     .build()
//!     .unwrap();
//!
//! let exchange = connection.send(request).unwrap();
//! println!("status: {}", exchange.status().unwrap());
//! let mut body = Vec::new();
//! exchange.response_body().read_to_end(&mut body).unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod flow_control;
pub mod frames;
pub mod muxer;
pub mod pool;
pub mod registry;
pub mod request_headers;
pub mod response_headers;
pub mod settings;
pub mod stream;

pub use codec::{FrameCodec, FrameReader, FrameWriter};
pub use config::{ConnectionBuilder, ConnectionConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, ErrorCode, Result};
pub use exchange::{Exchange, RequestBody, ResponseBody};
pub use flow_control::{FlowControlWindow, ReceiveWindow};
pub use frames::{Frame, FrameFlags, FrameHeader, FrameType, GoawayFrame};
pub use registry::StreamRegistry;
pub use settings::{RemoteSettings, Settings, SettingsBuilder, SettingsParameter};
pub use stream::{PackedStreamState, ReadState, StreamId, StreamState};

use std::time::Duration;

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 9113 Section 3.4:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 9;

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Largest value SETTINGS_MAX_FRAME_SIZE may take (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Concurrent streams advertised to the peer by default
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Largest flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFFFFFF;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Receive windows are replenished once they drop below initial / this
pub const WINDOW_UPDATE_THRESHOLD_DIVISOR: i64 = 3;

/// Cadence of the writer loop's timeout sweep, and the length of one tick
pub const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(100);
