//! HTTP request model and transport plumbing for h2mux
//!
//! This module holds the collaborator-facing pieces the HTTP/2 engine consumes:
//! the request model, an ordered multi-value header collection, and the
//! session operations abstraction over plain TCP and TLS byte streams.
//!
//! # Architecture
//!
//! The engine never touches sockets directly. It talks to a `SessionOps`
//! implementation that can be driven from two threads at once (one reader,
//! one writer):
//!
//! - `SessionOps` defines the operations (read, write, flush, timeout, close)
//! - `TcpStream` implements it for prior-knowledge h2 over plain TCP
//! - `TlsSessionOps` implements it for an already-established TLS session
//!
//! # Examples
//!
//! ```no_run
//! use h2mux::http::{HttpRequest, Method};
//! use h2mux::http::h2::ConnectionBuilder;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let connection = ConnectionBuilder::new().connect(stream).unwrap();
//!
//! let request = HttpRequest::builder()
//!     .method(Method::Get)
//!     .uri("http://127.0.0.1:8080/")
//!     .build()
//!     .unwrap();
//! let exchange = connection.send(request).unwrap();
//! assert_eq!(exchange.status().unwrap(), 200);
//! ```

pub mod h2;
pub mod headers;
pub mod message;
pub mod session;
pub mod tls;

pub use headers::Headers;
pub use message::{Body, HttpRequest, HttpRequestBuilder, Method, Uri};
pub use session::SessionOps;
pub use tls::TlsSessionOps;

use std::io;
use std::sync::Arc;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;
