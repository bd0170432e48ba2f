//! TLS support for HTTP/2 connections
//!
//! The engine runs over an already-established TLS session. This module
//! adapts an OpenSSL `SslStream` to the `SessionOps` trait so that the reader
//! and writer loops can share it.
//!
//! # Architecture
//!
//! 1. The caller (or `TlsSessionOps::connect`) completes the TLS handshake
//!    with ALPN offering `h2`
//! 2. `TlsSessionOps` switches the socket to non-blocking mode and guards the
//!    SSL object with a mutex that is held only for a single record operation
//! 3. Readers and writers wait for socket readiness with `poll(2)` outside the
//!    lock, so a reader parked on an idle connection never stalls the writer
//!
//! # Examples
//!
//! ```no_run
//! use h2mux::http::tls::TlsSessionOps;
//! use h2mux::http::h2::ConnectionBuilder;
//! use std::net::TcpStream;
//!
//! let tcp = TcpStream::connect("example.com:443").unwrap();
//! let session = TlsSessionOps::connect(tcp, "example.com", true).unwrap();
//! assert_eq!(session.alpn(), Some(&b"h2"[..]));
//! let connection = ConnectionBuilder::new().connect(session).unwrap();
//! ```

pub mod session;

pub use session::TlsSessionOps;

/// ALPN protocol list offering only HTTP/2 (wire format)
pub const H2_ALPN: &[u8] = b"\x02h2";
