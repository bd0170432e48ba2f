//! h2mux - multiplexed HTTP/2 client connections
//!
//! This crate provides a blocking, thread-based HTTP/2 client connection engine:
//! binary frame I/O, stream multiplexing over a single socket, connection and
//! stream flow control, and the request/response exchange lifecycle.

pub mod http;
