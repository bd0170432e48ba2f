//! Request header block construction
//!
//! Builds the HTTP/2 field list for a request (pseudo-headers first, then
//! regular fields with connection-specific ones removed) and compresses it
//! with HPACK. Lives on the writer loop, which is the only user of the
//! encoder's state.

use super::error::{Error, Result};
use super::DEFAULT_HEADER_TABLE_SIZE;
use crate::http::{Headers, HttpRequest, Method};
use bytes::Bytes;

/// Fields that are meaningful only to HTTP/1.1 and are never sent over HTTP/2
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Fields encoded as never-indexed literals
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization", "set-cookie"];

/// Per-field overhead in the RFC 9113 header list size accounting
const FIELD_OVERHEAD: usize = 32;

/// Literal without indexing, new name
const LITERAL_WITHOUT_INDEXING: u8 = 0x00;
/// Literal never indexed, new name
const LITERAL_NEVER_INDEXED: u8 = 0x10;

/// HPACK encoding for request headers and trailers
pub struct HeaderEncoder {
    hpack: hpack::Encoder<'static>,
    literal_only: bool,
    block: Vec<u8>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        HeaderEncoder {
            hpack: hpack::Encoder::new(),
            literal_only: false,
            block: Vec::with_capacity(256),
        }
    }

    /// Follow the peer's SETTINGS_HEADER_TABLE_SIZE
    ///
    /// A table smaller than the default switches to literal representations
    /// that never reference the peer's tables.
    pub fn set_max_table_size(&mut self, size: u32) {
        self.literal_only = size < DEFAULT_HEADER_TABLE_SIZE;
    }

    pub fn is_literal_only(&self) -> bool {
        self.literal_only
    }

    /// Encode the header block for `request`
    ///
    /// Fails before producing any bytes if the field list exceeds
    /// `max_header_list_size`.
    pub fn encode_request(&mut self, request: &HttpRequest, max_header_list_size: u32) -> Result<Bytes> {
        let fields = request_fields(request);
        let size: usize = fields
            .iter()
            .map(|(name, value, _)| name.len() + value.len() + FIELD_OVERHEAD)
            .sum();
        if max_header_list_size != u32::MAX && size > max_header_list_size as usize {
            return Err(Error::HeaderListTooLarge {
                size,
                limit: max_header_list_size,
            });
        }

        self.block.clear();
        for (name, value, sensitive) in &fields {
            self.encode_field(name.as_bytes(), value.as_bytes(), *sensitive)?;
        }
        Ok(Bytes::copy_from_slice(&self.block))
    }

    /// Encode a trailer block; pseudo-headers are rejected
    pub fn encode_trailers(&mut self, stream_id: u32, trailers: &Headers) -> Result<Bytes> {
        validate_trailers(stream_id, trailers)?;
        self.block.clear();
        for (name, value) in trailers.iter() {
            let name = name.to_ascii_lowercase();
            let sensitive = is_sensitive(&name);
            self.encode_field(name.as_bytes(), value.as_bytes(), sensitive)?;
        }
        Ok(Bytes::copy_from_slice(&self.block))
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], sensitive: bool) -> Result<()> {
        if sensitive {
            encode_literal(&mut self.block, LITERAL_NEVER_INDEXED, name, value);
        } else if self.literal_only {
            encode_literal(&mut self.block, LITERAL_WITHOUT_INDEXING, name, value);
        } else {
            self.hpack
                .encode_into(std::iter::once((name, value)), &mut self.block)
                .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;
        }
        Ok(())
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject trailers carrying pseudo-headers
pub fn validate_trailers(stream_id: u32, trailers: &Headers) -> Result<()> {
    match trailers.iter().find(|(name, _)| name.starts_with(':')) {
        Some((name, _)) => Err(Error::StreamProtocol {
            stream_id,
            reason: format!("trailers must not contain pseudo-header {}", name),
        }),
        None => Ok(()),
    }
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS.contains(&name)
}

/// The ordered (name, value, sensitive) list sent for a request
fn request_fields(request: &HttpRequest) -> Vec<(String, String, bool)> {
    let uri = request.uri();
    let method = request.method();
    let is_connect = method == Method::Connect;

    let mut fields = Vec::with_capacity(4 + request.headers().len());
    fields.push((":method".to_string(), method.as_str().to_string(), false));
    if !is_connect {
        fields.push((":scheme".to_string(), uri.scheme().to_ascii_lowercase(), false));
    }
    fields.push((":authority".to_string(), uri.authority(), false));
    if !is_connect {
        fields.push((":path".to_string(), uri.path_and_query(), false));
    }

    for (name, value) in request.headers().iter() {
        let name = name.to_ascii_lowercase();
        if CONNECTION_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        let sensitive = is_sensitive(&name);
        fields.push((name, value.to_string(), sensitive));
    }
    fields
}

/// Literal field with a literal name, strings not Huffman-coded
fn encode_literal(dst: &mut Vec<u8>, representation: u8, name: &[u8], value: &[u8]) {
    dst.push(representation);
    encode_string(dst, name);
    encode_string(dst, value);
}

fn encode_string(dst: &mut Vec<u8>, s: &[u8]) {
    encode_integer(dst, s.len(), 7, 0x00);
    dst.extend_from_slice(s);
}

/// HPACK integer with an N-bit prefix (RFC 7541 Section 5.1)
fn encode_integer(dst: &mut Vec<u8>, mut value: usize, prefix_bits: u8, flags: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.push(flags | value as u8);
        return;
    }
    dst.push(flags | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        dst.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    dst.push(value as u8);
}
