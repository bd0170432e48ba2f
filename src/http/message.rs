//! HTTP message types
//!
//! This module defines the request model handed to an HTTP/2 connection:
//! method, parsed URI, headers, body shape and optional trailers.

use super::{Error, Headers, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use bytes::Bytes;
use std::fmt;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from string
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl Uri {
    /// Parse an absolute `scheme://host[:port][/path][?query]` URI
    ///
    /// Fragments are dropped. IPv6 literals must be bracketed.
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme: {}", input)))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
            return Err(Error::InvalidUri(format!("bad scheme: {}", input)));
        }

        let rest = rest.split('#').next().unwrap_or("");
        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, target) = rest.split_at(authority_end);

        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let (host, port) = split_host_port(authority)?;
        if host.is_empty() {
            return Err(Error::InvalidUri(format!("missing host: {}", input)));
        }

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        Ok(Uri {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
            query,
        })
    }

    /// Scheme, lowercased
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host without port
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if one was given
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Path as given, possibly empty
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string without the leading `?`
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn default_port(&self) -> Option<u16> {
        match self.scheme.as_str() {
            "http" => Some(DEFAULT_HTTP_PORT),
            "https" => Some(DEFAULT_HTTPS_PORT),
            _ => None,
        }
    }

    /// `host[:port]`, omitting the port when it is the scheme default
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) if Some(port) != self.default_port() => format!("{}:{}", self.host, port),
            _ => self.host.clone(),
        }
    }

    /// Path (defaulting to `/`) followed by `?query` when present
    pub fn path_and_query(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        match &self.query {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::InvalidUri(format!("bad port: {}", p)))
    };

    if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| Error::InvalidUri(format!("unterminated IPv6 literal: {}", authority)))?;
        let host = &authority[..end + 2];
        return match &stripped[end + 1..] {
            "" => Ok((host, None)),
            rest => match rest.strip_prefix(':') {
                Some(p) => Ok((host, Some(parse_port(p)?))),
                None => Err(Error::InvalidUri(format!("bad authority: {}", authority))),
            },
        };
    }

    match authority.rsplit_once(':') {
        Some((host, p)) => Ok((host, Some(parse_port(p)?))),
        None => Ok((authority, None)),
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path_and_query())
    }
}

/// Request body shape
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    /// No body; HEADERS carries END_STREAM
    #[default]
    Empty,
    /// Fully buffered body written by `Connection::send`
    Bytes(Bytes),
    /// Body streamed by the caller through `Exchange::request_body`
    Streaming { content_length: Option<u64> },
}

impl Body {
    /// Whether HEADERS must leave the stream open
    pub fn expects_data(&self) -> bool {
        match self {
            Body::Empty => false,
            Body::Bytes(b) => !b.is_empty(),
            Body::Streaming { .. } => true,
        }
    }

    /// Known length, if any
    pub fn content_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Streaming { content_length } => *content_length,
        }
    }
}

/// HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    headers: Headers,
    body: Body,
    trailers: Option<Headers>,
}

impl HttpRequest {
    /// Create a new request with no headers and no body
    pub fn new(method: Method, uri: Uri) -> Self {
        HttpRequest {
            method,
            uri,
            headers: Headers::new(),
            body: Body::Empty,
            trailers: None,
        }
    }

    /// Create a builder for constructing requests
    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Get the request URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Get the body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Set the body
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Trailers to send after the body
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    /// Whether HEADERS must leave the stream open for DATA or trailers
    pub fn has_body(&self) -> bool {
        self.body.expects_data() || self.trailers.is_some()
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct HttpRequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    headers: Headers,
    body: Body,
    trailers: Option<Headers>,
}

impl HttpRequestBuilder {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the absolute URI
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a buffered body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// Declare a body the caller will stream after the exchange starts
    pub fn streaming_body(mut self, content_length: Option<u64>) -> Self {
        self.body = Body::Streaming { content_length };
        self
    }

    /// Add a trailer field
    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers
            .get_or_insert_with(Headers::new)
            .insert(name, value);
        self
    }

    /// Build the request
    pub fn build(self) -> Result<HttpRequest> {
        let uri = self
            .uri
            .ok_or_else(|| Error::InvalidUri("no URI set".to_string()))?;
        Ok(HttpRequest {
            method: self.method.unwrap_or(Method::Get),
            uri: Uri::parse(&uri)?,
            headers: self.headers,
            body: self.body,
            trailers: self.trailers,
        })
    }
}
