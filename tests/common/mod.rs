//! Scripted HTTP/2 peer for integration tests
//!
//! The peer runs on its own thread, speaks raw frames through the crate's
//! codec and keeps its own HPACK state, so each test controls exactly what
//! the client sees.

#![allow(dead_code)]

use h2mux::http::h2::codec::{FrameCodec, FrameWriter};
use h2mux::http::h2::frames::{Frame, FrameFlags, FrameType};
use h2mux::http::h2::{Connection, ConnectionBuilder, Result};
use h2mux::http::{HttpRequest, Method};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One stream shared by the codec's read and write halves
pub struct Half<S>(Arc<Mutex<S>>);

impl<S> Clone for Half<S> {
    fn clone(&self) -> Self {
        Half(self.0.clone())
    }
}

impl<S: Read> Read for Half<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().read(buf)
    }
}

impl<S: Write> Write for Half<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

/// A request as the peer decoded it
#[derive(Debug)]
pub struct ReceivedRequest {
    pub stream_id: u32,
    pub end_stream: bool,
    pub fields: Vec<(String, String)>,
}

impl ReceivedRequest {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Server side of a test connection
pub struct MockPeer<S: Read + Write> {
    codec: FrameCodec<Half<S>, Half<S>>,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl MockPeer<TcpStream> {
    pub fn tcp(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.set_nodelay(true).unwrap();
        MockPeer::new(stream)
    }
}

impl<S: Read + Write> MockPeer<S> {
    pub fn new(stream: S) -> Self {
        let half = Half(Arc::new(Mutex::new(stream)));
        MockPeer {
            codec: FrameCodec::new(half.clone(), half),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    /// Read the preface and the client's SETTINGS, answer with `settings`
    /// and an ACK; returns the client's settings
    pub fn handshake(&mut self, settings: &[(u16, u32)]) -> Vec<(u16, u32)> {
        let client = self.read_client_preface();
        self.codec.writer().write_settings(settings).unwrap();
        self.codec.writer().write_settings_ack().unwrap();
        self.flush();
        client
    }

    /// Read the preface and the client's first SETTINGS
    pub fn read_client_preface(&mut self) -> Vec<(u16, u32)> {
        self.codec.reader().read_preface().unwrap();
        let frame = self.read_frame();
        assert_eq!(frame.frame_type, FrameType::Settings);
        assert!(!frame.flags.is_ack());
        frame.settings().unwrap()
    }

    pub fn read_frame(&mut self) -> Frame {
        self.codec
            .read_frame()
            .unwrap()
            .expect("client closed the connection")
    }

    /// Next frame that is not a SETTINGS ACK or a WINDOW_UPDATE
    pub fn next_frame(&mut self) -> Frame {
        loop {
            let frame = self.read_frame();
            match frame.frame_type {
                FrameType::WindowUpdate => continue,
                FrameType::Settings if frame.flags.is_ack() => continue,
                _ => return frame,
            }
        }
    }

    pub fn expect(&mut self, kind: FrameType) -> Frame {
        let frame = self.next_frame();
        assert_eq!(frame.frame_type, kind, "unexpected frame {:?}", frame);
        frame
    }

    pub fn decode(&mut self, frame: &Frame) -> Vec<(String, String)> {
        self.decoder
            .decode(&frame.payload)
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }

    pub fn read_request(&mut self) -> ReceivedRequest {
        let frame = self.expect(FrameType::Headers);
        ReceivedRequest {
            stream_id: frame.stream_id,
            end_stream: frame.flags.is_end_stream(),
            fields: self.decode(&frame),
        }
    }

    /// Collect DATA for `stream_id` until END_STREAM, crediting both
    /// windows as it goes
    pub fn read_body(&mut self, stream_id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let frame = self.expect(FrameType::Data);
            assert_eq!(frame.stream_id, stream_id);
            body.extend_from_slice(&frame.payload);
            if frame.flags.is_end_stream() {
                return body;
            }
            if !frame.payload.is_empty() {
                let len = frame.payload.len() as u32;
                self.codec.writer().write_window_update(0, len).unwrap();
                self.codec.writer().write_window_update(stream_id, len).unwrap();
                self.flush();
            }
        }
    }

    pub fn send_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        self.codec.write_headers(stream_id, &block, end_stream).unwrap();
        self.flush();
    }

    pub fn respond(&mut self, stream_id: u32, status: u16, end_stream: bool) {
        let status = status.to_string();
        self.send_headers(stream_id, &[(":status", &status)], end_stream);
    }

    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        self.codec.writer().write_data(stream_id, data, end_stream).unwrap();
        self.flush();
    }

    pub fn send_frame(&mut self, kind: FrameType, flags: u8, stream_id: u32, payload: &[u8]) {
        self.codec
            .write_frame(kind, FrameFlags::from_u8(flags), stream_id, payload)
            .unwrap();
        self.flush();
    }

    pub fn writer(&mut self) -> &mut FrameWriter<Half<S>> {
        self.codec.writer()
    }

    pub fn flush(&mut self) {
        self.codec.flush().unwrap();
    }

    /// Read until the client closes; returns every frame seen on the way
    pub fn drain_until_eof(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.codec.read_frame() {
            frames.push(frame);
        }
        frames
    }
}

/// Start a peer running `script` and connect a client to it
pub fn start<F, T>(builder: ConnectionBuilder, script: F) -> (Result<Connection>, JoinHandle<T>)
where
    F: FnOnce(MockPeer<TcpStream>) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(MockPeer::tcp(stream))
    });

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nodelay(true).unwrap();
    (builder.connect(stream), server)
}

pub fn get(path: &str) -> HttpRequest {
    HttpRequest::builder()
        .method(Method::Get)
        .uri(format!("http://localhost{}", path))
        .build()
        .unwrap()
}

pub fn post(path: &str, body: &[u8]) -> HttpRequest {
    HttpRequest::builder()
        .method(Method::Post)
        .uri(format!("http://localhost{}", path))
        .body(body.to_vec())
        .build()
        .unwrap()
}

/// Route engine logs to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
