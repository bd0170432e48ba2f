//! Client connection: handshake, reader loop, lifecycle
//!
//! A `Connection` owns the session and the two background threads. The
//! reader loop lives here; the writer loop lives in the `Muxer`.
//!
//! The reader loop handles DATA on a fast path straight from the frame
//! header into a pooled buffer. Everything else is read as a `Frame` and
//! dispatched to connection-level handling or to the exchange registered
//! for its stream. Frames for streams that are no longer registered are
//! dropped, but header blocks are still decoded so the HPACK table stays in
//! step with the peer.

use super::codec::{FrameReader, FrameWriter};
use super::config::ConnectionConfig;
use super::error::{Error, ErrorCode, Result};
use super::exchange::{Exchange, ExchangeInner};
use super::flow_control::ReceiveWindow;
use super::frames::{Frame, FrameHeader, FrameType};
use super::muxer::Muxer;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, TIMEOUT_POLL_INTERVAL};
use crate::http::session::{SessionOps, SessionReader, SessionWriter};
use crate::http::{Body, HttpRequest};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Connection lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connected = 0,
    ShuttingDown = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connected,
            1 => ConnectionState::ShuttingDown,
            _ => ConnectionState::Closed,
        }
    }
}

struct Shared {
    name: String,
    session: Arc<dyn SessionOps>,
    mux: Arc<Muxer>,
    state: AtomicU8,
    recv_window: ReceiveWindow,
    config: ConnectionConfig,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Tear down after the reader loop stops
    fn on_reader_exit(&self, result: Result<()>) {
        let cause = match result {
            Ok(()) => Error::ConnectionClosed,
            Err(err) => err,
        };
        let was_connected = self.state() == ConnectionState::Connected;

        if was_connected {
            match &cause {
                Error::ConnectionClosed | Error::Io(_) | Error::GoAway { .. } => {
                    debug!(name = %self.name, error = %cause, "reader loop stopped");
                }
                err => {
                    // Tell the peer why before the writer goes away
                    debug!(name = %self.name, error = %err, "connection error");
                    self.mux.queue_goaway(0, err.code(), err.to_string());
                }
            }
        } else {
            debug!(name = %self.name, "reader loop exited");
        }

        self.mux.shutdown_now();
        self.mux.wait_writer_exit(TIMEOUT_POLL_INTERVAL);
        // A writer failure is the more precise cause
        let cause = self.mux.terminal_error().unwrap_or(cause);
        self.mux.set_terminal(cause.clone());
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.mux.fail_all(&cause);
        let _ = self.session.close();
    }
}

/// A multiplexed HTTP/2 client connection
pub struct Connection {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Run the client handshake over `session` and start both loops
    ///
    /// Sends the preface and SETTINGS (plus a connection WINDOW_UPDATE when
    /// the configured window exceeds the default), waits for the peer's
    /// SETTINGS and acknowledges it, then lingers briefly for the peer's
    /// first WINDOW_UPDATE. The session is closed if any step fails.
    pub fn handshake(session: Arc<dyn SessionOps>, config: ConnectionConfig) -> Result<Self> {
        let mux = Muxer::new(&config, &config.name);
        let local = config.local_settings()?;
        let mut writer = FrameWriter::new(SessionWriter(session.clone()), DEFAULT_MAX_FRAME_SIZE);
        let mut reader = FrameReader::new(SessionReader(session.clone()), local.get_max_frame_size());

        let pending = match exchange_settings(&*session, &config, &mux, &mut reader, &mut writer) {
            Ok(pending) => pending,
            Err(err) => {
                debug!(name = %config.name, error = %err, "handshake failed");
                let _ = session.close();
                return Err(err);
            }
        };

        let recv_window = config.initial_window_size.max(DEFAULT_INITIAL_WINDOW_SIZE);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            session: session.clone(),
            mux: mux.clone(),
            state: AtomicU8::new(ConnectionState::Connected as u8),
            recv_window: ReceiveWindow::new(recv_window),
            config,
        });

        if let Err(err) = mux.start(writer) {
            let _ = session.close();
            return Err(err);
        }

        let reader_loop = ReaderLoop {
            shared: shared.clone(),
            frames: reader,
            decoder: hpack::Decoder::new(),
            pending,
        };
        let handle = thread::Builder::new()
            .name(format!("h2-reader-{}", shared.name))
            .spawn(move || reader_loop.run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                mux.close(TIMEOUT_POLL_INTERVAL);
                let _ = session.close();
                return Err(err.into());
            }
        };

        debug!(
            name = %shared.name,
            max_concurrent_streams = mux.remote().max_concurrent_streams(),
            initial_window_size = mux.remote().initial_window_size(),
            max_frame_size = mux.remote().max_frame_size(),
            "handshake complete"
        );
        Ok(Connection {
            shared,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Issue a request
    ///
    /// Returns once HEADERS is on the wire. A buffered body (and the request
    /// trailers, if any) is written before returning; a streaming body is
    /// written by the caller through the returned exchange.
    pub fn send(&self, request: HttpRequest) -> Result<Exchange> {
        match self.state() {
            ConnectionState::Connected => {}
            _ => return Err(self.closed_error()),
        }
        let end_stream = !request.has_body();
        let inner = self.shared.mux.new_exchange(request)?;
        let exchange = Exchange::new(inner);
        self.submit(exchange.inner(), end_stream)?;

        let body = match exchange.request().body() {
            Body::Bytes(bytes) if !bytes.is_empty() => Some(bytes.clone()),
            _ => None,
        };
        let trailers = exchange.request().trailers().cloned();
        if let Some(body) = body {
            exchange.write_data(&body, trailers.is_none())?;
        }
        let streaming = matches!(exchange.request().body(), Body::Streaming { .. });
        if let Some(trailers) = trailers.filter(|_| !streaming) {
            exchange.write_trailers(trailers)?;
        }
        Ok(exchange)
    }

    fn submit(&self, exchange: &Arc<ExchangeInner>, end_stream: bool) -> Result<()> {
        self.shared.mux.submit_headers(exchange, end_stream)?;
        exchange.await_headers_written()
    }

    fn closed_error(&self) -> Error {
        self.shared
            .mux
            .terminal_error()
            .unwrap_or(Error::ConnectionClosed)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Whether the connection can take new requests
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.shared.mux.is_accepting()
            && self.shared.mux.terminal_error().is_none()
    }

    /// Whether a pooled connection is still fit for another request
    pub fn validate_for_reuse(&self) -> bool {
        self.is_active() && !self.shared.mux.goaway_received() && self.can_accept_more_streams()
    }

    /// Protocol selected by ALPN, if the session negotiated one
    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.shared.session.negotiated_protocol()
    }

    pub fn active_stream_count(&self) -> u32 {
        self.shared.mux.active_streams()
    }

    pub fn can_accept_more_streams(&self) -> bool {
        self.state() == ConnectionState::Connected && self.shared.mux.can_accept_more_streams()
    }

    /// Active streams, or `None` when no new stream would be admitted
    pub fn active_stream_count_if_accepting(&self) -> Option<u32> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.shared.mux.active_stream_count_if_accepting()
    }

    /// How long the connection has had no active streams
    pub fn idle_time_nanos(&self) -> u64 {
        self.shared.mux.idle_time_nanos()
    }

    /// The peer's current settings
    pub fn remote_settings(&self) -> &super::settings::RemoteSettings {
        self.shared.mux.remote()
    }

    /// Close gracefully
    ///
    /// Sends GOAWAY(NO_ERROR), lets the writer drain, fails still-open
    /// exchanges with `ConnectionClosed` after the grace period, then closes
    /// the session and joins the reader.
    pub fn close(&self) {
        if !self
            .shared
            .transition(ConnectionState::Connected, ConnectionState::ShuttingDown)
        {
            self.join_reader();
            return;
        }
        debug!(name = %self.shared.name, "closing connection");
        let grace = self.shared.config.graceful_shutdown;
        let mux = &self.shared.mux;

        mux.queue_goaway(0, ErrorCode::NoError.as_u32(), String::new());
        mux.close_exchanges(grace);
        mux.close(grace);

        self.shared
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let _ = self.shared.session.close();
        self.join_reader();
    }

    fn join_reader(&self) {
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("mux", &self.shared.mux)
            .finish()
    }
}

/// Preface, SETTINGS exchange and the opportunistic WINDOW_UPDATE wait
///
/// Returns the header of a frame read past the handshake, if any, for the
/// reader loop to continue with.
fn exchange_settings(
    session: &dyn SessionOps,
    config: &ConnectionConfig,
    mux: &Muxer,
    reader: &mut FrameReader<SessionReader>,
    writer: &mut FrameWriter<SessionWriter>,
) -> Result<Option<FrameHeader>> {
    writer.write_preface()?;
    writer.write_settings(&config.local_settings()?.encode())?;
    if config.initial_window_size > DEFAULT_INITIAL_WINDOW_SIZE {
        writer.write_window_update(0, config.initial_window_size - DEFAULT_INITIAL_WINDOW_SIZE)?;
    }
    writer.flush()?;

    session.set_read_timeout(Some(config.settings_timeout))?;
    let frame = match reader.read_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => return Err(Error::ConnectionClosed),
        Err(err) if err.is_io_timeout() => return Err(Error::SettingsTimeout),
        Err(err) => return Err(err),
    };
    if frame.frame_type != FrameType::Settings || frame.flags.is_ack() {
        return Err(Error::Protocol(format!(
            "expected SETTINGS as first frame, got {}",
            frame.frame_type
        )));
    }
    mux.apply_settings(&frame.settings()?)?;
    writer.set_max_frame_size(mux.remote().max_frame_size());
    writer.write_settings_ack()?;
    writer.flush()?;

    let mut pending = None;
    if !config.window_update_wait.is_zero() {
        session.set_read_timeout(Some(config.window_update_wait))?;
        loop {
            match reader.prefetch_frame() {
                Ok(()) => {}
                Err(err) if err.is_io_timeout() => break,
                Err(err) => return Err(err),
            }
            let Some(header) = reader.read_header()? else {
                return Err(Error::ConnectionClosed);
            };
            let kind = header.kind();
            if kind == Some(FrameType::WindowUpdate) && header.stream_id == 0 {
                let increment = reader.read_frame_body(header)?.window_increment()?;
                if increment == 0 {
                    return Err(Error::Protocol("WINDOW_UPDATE with zero increment".to_string()));
                }
                mux.release_connection_window(increment)?;
                trace!(increment, "initial connection WINDOW_UPDATE");
            } else if kind == Some(FrameType::Settings) && header.flags.is_ack() {
                reader.read_frame_body(header)?;
            } else {
                pending = Some(header);
                break;
            }
        }
    }
    session.set_read_timeout(None)?;
    Ok(pending)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// State owned by the reader thread
struct ReaderLoop {
    shared: Arc<Shared>,
    frames: FrameReader<SessionReader>,
    decoder: hpack::Decoder<'static>,
    /// Header read during the handshake whose payload is still unread
    pending: Option<FrameHeader>,
}

impl ReaderLoop {
    fn run(mut self) {
        debug!(name = %self.shared.name, "reader loop started");
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.run_loop())) {
            Ok(result) => result,
            Err(payload) => {
                warn!(name = %self.shared.name, "reader loop panicked");
                Err(Error::Internal(format!(
                    "reader loop panicked: {}",
                    panic_message(&*payload)
                )))
            }
        };
        self.shared.on_reader_exit(result);
    }

    /// Decode a header block; a decoder panic is a compression error
    fn decode_block(&mut self, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let decoder = &mut self.decoder;
        match panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(block))) {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(e)) => Err(Error::Compression(format!("HPACK decode failed: {:?}", e))),
            Err(payload) => Err(Error::Compression(format!(
                "HPACK decoder rejected header block: {}",
                panic_message(&*payload)
            ))),
        }
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut goaway: Option<Error> = None;
        loop {
            if self.shared.state() == ConnectionState::Closed {
                return Ok(());
            }
            let header = match self.pending.take() {
                Some(header) => header,
                None => match self.frames.read_header() {
                    Ok(Some(header)) => header,
                    Ok(None) => return Err(goaway.unwrap_or(Error::ConnectionClosed)),
                    Err(err) if self.shared.state() != ConnectionState::Connected => {
                        trace!(error = %err, "read failed during shutdown");
                        return Ok(());
                    }
                    Err(err) => return Err(goaway.unwrap_or(err)),
                },
            };
            match header.kind() {
                Some(FrameType::Data) => self.on_data(header)?,
                Some(_) => {
                    let frame = self.frames.read_frame_body(header)?;
                    if let Some(err) = self.dispatch(frame)? {
                        goaway = Some(err);
                    }
                }
                None => {
                    trace!(frame_type = header.frame_type, "skipping unknown frame type");
                    self.frames.skip(header.length as usize)?;
                }
            }
        }
    }

    fn mux(&self) -> &Muxer {
        &self.shared.mux
    }

    /// Client streams are odd and allocated in order; anything else has
    /// never been opened
    fn check_not_idle(&self, stream_id: u32, kind: FrameType) -> Result<()> {
        if stream_id % 2 == 0 || stream_id > self.mux().last_stream_id() {
            return Err(Error::Protocol(format!("{} on idle stream {}", kind, stream_id)));
        }
        Ok(())
    }

    fn on_data(&mut self, header: FrameHeader) -> Result<()> {
        let stream_id = header.stream_id;
        let len = header.length;
        self.check_not_idle(stream_id, FrameType::Data)?;

        if let Some(increment) = self.shared.recv_window.consume(len)? {
            self.mux().queue_window_update(0, increment);
        }

        let Some(exchange) = self.mux().exchange(stream_id) else {
            trace!(stream_id, len, "DATA for unknown stream");
            return self.frames.skip(len as usize);
        };
        let mut buf = self.mux().pool().borrow(len as usize);
        buf.resize(len as usize, 0);
        let n = self.frames.read_data_into(&header, &mut buf)?;
        buf.truncate(n);
        trace!(stream_id, len = n, end_stream = header.flags.is_end_stream(), "DATA");

        if let Err(err) = exchange.enqueue_data(buf, len, header.flags.is_end_stream()) {
            self.reset_stream(&exchange, err);
        }
        Ok(())
    }

    fn reset_stream(&self, exchange: &Arc<ExchangeInner>, err: Error) {
        debug!(error = %err, "resetting stream");
        exchange.reset(err);
    }

    /// Handle a non-DATA frame; returns the cause to report if the peer is
    /// going away with an error
    fn dispatch(&mut self, frame: Frame) -> Result<Option<Error>> {
        trace!(
            frame_type = %frame.frame_type,
            stream_id = frame.stream_id,
            flags = frame.flags.as_u8(),
            len = frame.payload.len(),
            "frame"
        );
        if frame.stream_id == 0 {
            self.on_connection_frame(frame)
        } else {
            self.on_stream_frame(frame).map(|()| None)
        }
    }

    fn on_connection_frame(&mut self, frame: Frame) -> Result<Option<Error>> {
        match frame.frame_type {
            FrameType::Settings => {
                if frame.flags.is_ack() {
                    trace!("SETTINGS acknowledged");
                } else {
                    self.mux().apply_settings(&frame.settings()?)?;
                    self.mux().queue_settings_ack();
                }
            }
            FrameType::Ping => {
                if !frame.flags.is_ack() {
                    self.mux().queue_ping(true, frame.ping_data()?);
                }
            }
            FrameType::Goaway => {
                let goaway = frame.goaway()?;
                let code = goaway.error_code;
                debug!(
                    name = %self.shared.name,
                    last_stream_id = goaway.last_stream_id,
                    code = %ErrorCode::name_of(code),
                    debug = %goaway.debug_text(),
                    "GOAWAY received"
                );
                self.mux().on_goaway(goaway.last_stream_id, code);
                if code != ErrorCode::NoError.as_u32() {
                    return Ok(Some(Error::GoAway {
                        last_stream_id: goaway.last_stream_id,
                        code,
                        debug: goaway.debug_text(),
                    }));
                }
            }
            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                if increment == 0 {
                    return Err(Error::Protocol(
                        "WINDOW_UPDATE with zero increment on connection".to_string(),
                    ));
                }
                self.mux().release_connection_window(increment)?;
            }
            other => trace!(frame_type = %other, "ignoring frame on stream 0"),
        }
        Ok(None)
    }

    fn on_stream_frame(&mut self, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        match frame.frame_type {
            FrameType::Headers => {
                // Decoded even for unknown streams to keep the table in sync
                let fields = self.decode_block(&frame.payload)?;
                self.check_not_idle(stream_id, FrameType::Headers)?;
                match self.mux().exchange(stream_id) {
                    Some(exchange) => {
                        if let Err(err) = exchange.deliver_headers(&fields, frame.flags.is_end_stream()) {
                            self.reset_stream(&exchange, err);
                        }
                    }
                    None => trace!(stream_id, "HEADERS for unknown stream"),
                }
            }
            FrameType::RstStream => {
                let code = frame.rst_error_code()?;
                self.check_not_idle(stream_id, FrameType::RstStream)?;
                if let Some(exchange) = self.mux().exchange(stream_id) {
                    debug!(stream_id, code = %ErrorCode::name_of(code), "stream reset by peer");
                    exchange.signal_error(Error::StreamReset { stream_id, code });
                    self.mux().release_stream(&exchange);
                }
            }
            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                let Some(exchange) = self.mux().exchange(stream_id) else {
                    return Ok(());
                };
                if increment == 0 {
                    let err = Error::StreamProtocol {
                        stream_id,
                        reason: "WINDOW_UPDATE with zero increment".to_string(),
                    };
                    self.reset_stream(&exchange, err);
                } else if let Err(err) = exchange.send_window().release(increment) {
                    let err = Error::StreamFlowControl {
                        stream_id,
                        reason: err.to_string(),
                    };
                    self.reset_stream(&exchange, err);
                }
            }
            FrameType::PushPromise => {
                return Err(Error::Protocol("PUSH_PROMISE received with push disabled".to_string()));
            }
            FrameType::Priority => {}
            other => {
                warn!(frame_type = %other, stream_id, "unexpected frame on stream");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::ShuttingDown,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }
}
