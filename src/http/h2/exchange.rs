//! Per-stream request/response exchange
//!
//! An `ExchangeInner` is shared by three parties: the caller that issued the
//! request, the reader loop delivering response frames, and the writer loop
//! draining outbound DATA. Inbound state sits behind one mutex with a
//! condition variable; outbound body chunks go through a lock-free queue the
//! writer loop drains.
//!
//! `Exchange` is the caller's handle. Dropping it closes the stream.

use super::error::{Error, ErrorCode, Result};
use super::flow_control::{FlowControlWindow, ReceiveWindow};
use super::muxer::Muxer;
use super::pool::PooledBuf;
use super::registry::RegistryEntry;
use super::request_headers::validate_trailers;
use super::response_headers::{
    process_response_headers, process_trailers, validate_content_length, ResponseHead,
};
use super::stream::PackedStreamState;
use super::TIMEOUT_POLL_INTERVAL;
use crate::http::{Headers, HttpRequest, Method};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Frames of credit requested from the stream window per acquisition
const STREAM_BATCH_FRAMES: usize = 4;

/// Chunks pulled out of the inbound queue per `ResponseBody` refill
const READ_BATCH_CHUNKS: usize = 16;

/// A 1xx response received ahead of the final one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationalResponse {
    pub status: u16,
    pub headers: Headers,
}

/// Outbound work queued on a stream, written by the writer loop in order
pub(crate) enum Outbound {
    Data { buf: PooledBuf, end_stream: bool },
    Trailers(Headers),
}

#[derive(Default)]
struct Inbound {
    /// Outcome of the HEADERS submission, set by the writer loop
    submitted: Option<Result<()>>,
    informational: Vec<InformationalResponse>,
    headers: Option<Headers>,
    content_length: Option<u64>,
    trailers: Option<Headers>,
    chunks: VecDeque<PooledBuf>,
    received: u64,
    error: Option<Error>,
    eof_checked: bool,
}

/// Shared state of one stream
pub(crate) struct ExchangeInner {
    mux: Arc<Muxer>,
    request: HttpRequest,
    stream_id: AtomicU32,
    state: PackedStreamState,

    inbound: Mutex<Inbound>,
    readable: Condvar,

    send_window: FlowControlWindow,
    recv_window: ReceiveWindow,

    pending: SegQueue<Outbound>,
    in_data_queue: AtomicBool,
    /// END_STREAM (or trailers) queued by the caller
    local_finished: AtomicBool,
    /// Outbound frames are dropped instead of written
    discard_outbound: AtomicBool,

    /// Holds one of the peer's concurrent-stream slots
    slot_held: AtomicBool,
    closed: AtomicBool,

    read_seq: AtomicU64,
    read_deadline_tick: AtomicU32,
    read_timed_out: AtomicBool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RegistryEntry for ExchangeInner {
    fn stream_id(&self) -> u32 {
        self.stream_id.load(Ordering::Acquire)
    }
}

impl ExchangeInner {
    pub(crate) fn new(
        mux: Arc<Muxer>,
        request: HttpRequest,
        send_window: u32,
        recv_window: u32,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let local_finished = !request.has_body();
        ExchangeInner {
            mux,
            request,
            stream_id: AtomicU32::new(0),
            state: PackedStreamState::new(),
            inbound: Mutex::new(Inbound::default()),
            readable: Condvar::new(),
            send_window: FlowControlWindow::new(send_window),
            recv_window: ReceiveWindow::new(recv_window),
            pending: SegQueue::new(),
            in_data_queue: AtomicBool::new(false),
            local_finished: AtomicBool::new(local_finished),
            discard_outbound: AtomicBool::new(false),
            slot_held: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            read_seq: AtomicU64::new(0),
            read_deadline_tick: AtomicU32::new(0),
            read_timed_out: AtomicBool::new(false),
            read_timeout,
            write_timeout,
        }
    }

    pub(crate) fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub(crate) fn state(&self) -> &PackedStreamState {
        &self.state
    }

    pub(crate) fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Give up the concurrent-stream slot; true only for the first caller
    pub(crate) fn take_slot(&self) -> bool {
        self.slot_held.swap(false, Ordering::AcqRel)
    }

    // ---- writer loop side -------------------------------------------------

    pub(crate) fn assign_stream_id(&self, stream_id: u32) {
        self.stream_id.store(stream_id, Ordering::Release);
    }

    /// Record the outcome of the HEADERS submission and wake the caller
    pub(crate) fn headers_written(&self, result: Result<()>) {
        if result.is_ok() {
            self.touch_read();
        }
        let mut inbound = self.inbound.lock();
        inbound.submitted = Some(result);
        drop(inbound);
        self.readable.notify_all();
    }

    pub(crate) fn pop_outbound(&self) -> Option<Outbound> {
        self.pending.pop()
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn discards_outbound(&self) -> bool {
        self.discard_outbound.load(Ordering::Acquire)
    }

    /// Clear the queued flag; returns whether it was set
    pub(crate) fn clear_data_queued(&self) -> bool {
        self.in_data_queue.swap(false, Ordering::AcqRel)
    }

    /// Set the queued flag; returns true if it was newly set
    pub(crate) fn mark_data_queued(&self) -> bool {
        !self.in_data_queue.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn read_seq(&self) -> u64 {
        self.read_seq.load(Ordering::Acquire)
    }

    pub(crate) fn read_deadline_tick(&self) -> u32 {
        self.read_deadline_tick.load(Ordering::Acquire)
    }

    /// Claim the read timeout; only the first claimant gets true
    pub(crate) fn mark_read_timed_out(&self) -> bool {
        !self.read_timed_out.swap(true, Ordering::AcqRel)
    }

    fn touch_read(&self) {
        self.read_seq.fetch_add(1, Ordering::AcqRel);
        let deadline = if self.state.end_stream_received() {
            0
        } else {
            self.mux.deadline_tick(self.read_timeout)
        };
        self.read_deadline_tick.store(deadline, Ordering::Release);
    }

    fn disarm_read_deadline(&self) {
        self.read_deadline_tick.store(0, Ordering::Release);
    }

    // ---- reader loop side -------------------------------------------------

    /// Queue an inbound DATA payload
    ///
    /// `flow_len` is the full frame length, padding included. Errors are
    /// stream-scoped; the caller resets the stream.
    pub(crate) fn enqueue_data(&self, buf: PooledBuf, flow_len: u32, end_stream: bool) -> Result<()> {
        let stream_id = self.stream_id();
        match self.recv_window.consume(flow_len) {
            Ok(Some(increment)) if !end_stream => self.mux.queue_window_update(stream_id, increment),
            Ok(_) => {}
            Err(_) => {
                return Err(Error::StreamFlowControl {
                    stream_id,
                    reason: format!("DATA of {} bytes exceeds the stream receive window", flow_len),
                })
            }
        }

        let mut inbound = self.inbound.lock();
        if inbound.error.is_some() {
            return Ok(());
        }
        if !self.state.headers_received() {
            return Err(Error::StreamProtocol {
                stream_id,
                reason: "DATA before response HEADERS".to_string(),
            });
        }
        if self.state.end_stream_received() {
            return Err(Error::StreamClosed(stream_id));
        }
        inbound.received += buf.len() as u64;
        if !buf.is_empty() {
            inbound.chunks.push_back(buf);
        }
        if end_stream {
            self.state.mark_end_stream_received();
        }
        drop(inbound);
        self.touch_read();
        self.readable.notify_all();
        Ok(())
    }

    /// Hand over a decoded header block
    ///
    /// The first final block is the response head; a later block must end
    /// the stream and becomes the trailers.
    pub(crate) fn deliver_headers(&self, fields: &[(Vec<u8>, Vec<u8>)], end_stream: bool) -> Result<()> {
        let stream_id = self.stream_id();
        let mut inbound = self.inbound.lock();
        if inbound.error.is_some() {
            return Ok(());
        }
        if self.state.end_stream_received() {
            return Err(Error::StreamClosed(stream_id));
        }

        if !self.state.headers_received() {
            match process_response_headers(fields, stream_id, end_stream)? {
                ResponseHead::Informational { status, headers } => {
                    trace!(stream_id, status, "informational response");
                    inbound
                        .informational
                        .push(InformationalResponse { status, headers });
                }
                ResponseHead::Final {
                    status,
                    headers,
                    content_length,
                } => {
                    inbound.headers = Some(headers);
                    inbound.content_length = content_length;
                    self.state.set_response_headers_received(status);
                }
            }
        } else {
            if !end_stream {
                return Err(Error::StreamProtocol {
                    stream_id,
                    reason: "trailers without END_STREAM".to_string(),
                });
            }
            inbound.trailers = Some(process_trailers(fields, stream_id)?);
        }

        if end_stream {
            self.state.mark_end_stream_received();
        }
        drop(inbound);
        self.touch_read();
        self.readable.notify_all();
        Ok(())
    }

    /// Fail the exchange; the first error recorded wins
    ///
    /// Once both sides have ended, the buffered response stays readable and
    /// the error is not recorded.
    pub(crate) fn signal_error(&self, error: Error) {
        self.discard_outbound.store(true, Ordering::Release);
        self.disarm_read_deadline();
        let mut inbound = self.inbound.lock();
        if inbound.submitted.is_none() {
            inbound.submitted = Some(Err(error.clone()));
        }
        let complete =
            self.state.end_stream_received() && self.local_finished.load(Ordering::Acquire);
        if complete {
            drop(inbound);
            self.readable.notify_all();
            return;
        }
        if inbound.error.is_none() {
            inbound.error = Some(error);
        }
        self.state.set_error_state();
        drop(inbound);
        self.readable.notify_all();
    }

    /// Apply an INITIAL_WINDOW_SIZE delta to the send window
    pub(crate) fn adjust_send_window(&self, delta: i64) -> Result<()> {
        self.send_window.adjust(delta)
    }

    // ---- caller side ------------------------------------------------------

    /// Wait for the writer loop to put the HEADERS frame on the wire
    pub(crate) fn await_headers_written(&self) -> Result<()> {
        let mut inbound = self.inbound.lock();
        loop {
            if let Some(result) = inbound.submitted.as_ref() {
                return result.clone();
            }
            if let Some(err) = self.mux.terminal_error() {
                return Err(err);
            }
            self.readable.wait_for(&mut inbound, TIMEOUT_POLL_INTERVAL);
        }
    }

    fn wait_for<T>(&self, mut ready: impl FnMut(&Inbound) -> Option<T>) -> Result<T> {
        let mut inbound = self.inbound.lock();
        loop {
            if let Some(err) = inbound.error.as_ref() {
                return Err(err.clone());
            }
            if let Some(value) = ready(&*inbound) {
                return Ok(value);
            }
            if self.is_closed() {
                return Err(Error::Cancelled(self.stream_id()));
            }
            if let Some(err) = self.mux.terminal_error() {
                return Err(err);
            }
            self.readable.wait_for(&mut inbound, TIMEOUT_POLL_INTERVAL);
        }
    }

    fn response_headers(&self) -> Result<(u16, Headers)> {
        self.wait_for(|inbound| {
            let status = self.state.status()?;
            inbound.headers.clone().map(|headers| (status, headers))
        })
    }

    fn trailers(&self) -> Result<Option<Headers>> {
        self.wait_for(|inbound| {
            self.state
                .end_stream_received()
                .then(|| inbound.trailers.clone())
        })
    }

    fn informational(&self) -> Vec<InformationalResponse> {
        self.inbound.lock().informational.clone()
    }

    /// Move up to `max_chunks` received chunks into `dest`
    ///
    /// Blocks while nothing is buffered and the stream is open. Returns
    /// `None` at end of stream, after checking the received length against
    /// content-length.
    pub(crate) fn drain_chunks(&self, dest: &mut VecDeque<PooledBuf>, max_chunks: usize) -> Result<Option<usize>> {
        let mut inbound = self.inbound.lock();
        loop {
            if let Some(err) = inbound.error.as_ref() {
                return Err(err.clone());
            }
            if !inbound.chunks.is_empty() {
                let n = inbound.chunks.len().min(max_chunks.max(1));
                dest.extend(inbound.chunks.drain(..n));
                return Ok(Some(n));
            }
            if self.state.headers_received() && self.state.end_stream_received() {
                if !inbound.eof_checked {
                    inbound.eof_checked = true;
                    if let Err(err) = self.check_content_length(&*inbound) {
                        inbound.error = Some(err.clone());
                        self.state.set_error_state();
                        drop(inbound);
                        self.reset(err.clone());
                        return Err(err);
                    }
                }
                drop(inbound);
                self.close();
                return Ok(None);
            }
            if self.is_closed() {
                return Ok(None);
            }
            if let Some(err) = self.mux.terminal_error() {
                return Err(err);
            }
            self.readable.wait_for(&mut inbound, TIMEOUT_POLL_INTERVAL);
        }
    }

    fn check_content_length(&self, inbound: &Inbound) -> Result<()> {
        let exempt = self.request.method() == Method::Head
            || matches!(self.state.status(), Some(204) | Some(304));
        if exempt {
            return Ok(());
        }
        validate_content_length(inbound.content_length, inbound.received, self.stream_id())
    }

    fn check_writable(&self) -> Result<u32> {
        if let Some(err) = self.inbound.lock().error.as_ref() {
            return Err(err.clone());
        }
        let stream_id = self.stream_id();
        if self.is_closed() || self.local_finished.load(Ordering::Acquire) {
            return Err(Error::StreamClosed(stream_id));
        }
        if stream_id == 0 {
            return Err(Error::Internal("body written before HEADERS".to_string()));
        }
        if let Some(err) = self.mux.terminal_error() {
            return Err(err);
        }
        Ok(stream_id)
    }

    /// Wait for credit on `window`, noticing stream failure between waits
    fn acquire(&self, window: &FlowControlWindow, max: u32, deadline: Instant) -> Result<u32> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WriteTimeout {
                    stream_id: self.stream_id(),
                });
            }
            let slice = (deadline - now).min(TIMEOUT_POLL_INTERVAL);
            let acquired = window.try_acquire_up_to(max, slice);
            if acquired > 0 {
                return Ok(acquired);
            }
            self.check_writable()?;
        }
    }

    /// Queue body bytes as flow-controlled DATA frames
    pub(crate) fn write_data(self: &Arc<Self>, data: &[u8], end_stream: bool) -> Result<()> {
        let stream_id = self.check_writable()?;
        if data.is_empty() {
            if end_stream {
                self.local_finished.store(true, Ordering::Release);
                self.pending.push(Outbound::Data {
                    buf: self.mux.pool().borrow(0),
                    end_stream: true,
                });
                self.mux.signal_data_ready(self);
            }
            return Ok(());
        }

        let mut offset = 0;
        while offset < data.len() {
            let deadline = Instant::now() + self.write_timeout;
            let max_frame = self.mux.remote().max_frame_size() as usize;
            let want = (data.len() - offset).min(max_frame * STREAM_BATCH_FRAMES);

            let stream_credit = self.acquire(&self.send_window, want as u32, deadline)?;
            let conn_credit = match self.acquire(self.mux.send_window(), stream_credit, deadline) {
                Ok(credit) => credit,
                Err(err) => {
                    let _ = self.send_window.release(stream_credit);
                    return Err(err);
                }
            };
            if conn_credit < stream_credit {
                let _ = self.send_window.release(stream_credit - conn_credit);
            }

            let end = offset + conn_credit as usize;
            let last_batch = end == data.len();
            if last_batch && end_stream {
                self.local_finished.store(true, Ordering::Release);
            }
            for chunk in data[offset..end].chunks(max_frame) {
                let buf = self.mux.pool().copy_from(chunk);
                let consumed = offset + buf.len();
                offset = consumed;
                self.pending.push(Outbound::Data {
                    buf,
                    end_stream: end_stream && consumed == data.len(),
                });
            }
            trace!(stream_id, bytes = conn_credit, "queued DATA");
            self.mux.signal_data_ready(self);
        }
        self.touch_read();
        Ok(())
    }

    /// Queue trailers, ending the stream after any queued DATA
    pub(crate) fn write_trailers(self: &Arc<Self>, trailers: Headers) -> Result<()> {
        let stream_id = self.check_writable()?;
        validate_trailers(stream_id, &trailers)?;
        self.local_finished.store(true, Ordering::Release);
        self.pending.push(Outbound::Trailers(trailers));
        self.mux.signal_data_ready(self);
        Ok(())
    }

    /// End the request side: trailers from the request if it has any,
    /// otherwise an empty DATA frame with END_STREAM
    pub(crate) fn finish(self: &Arc<Self>) -> Result<()> {
        if self.local_finished.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.request.trailers() {
            Some(trailers) => self.write_trailers(trailers.clone()),
            None => self.write_data(&[], true),
        }
    }

    /// Fail the stream and tell the peer
    pub(crate) fn reset(&self, error: Error) {
        let stream_id = self.stream_id();
        let code = error.code();
        self.signal_error(error);
        if stream_id != 0 {
            self.mux.queue_rst(stream_id, code);
        }
        self.mux.release_stream(self);
    }

    /// Close the exchange
    ///
    /// Queues RST_STREAM(CANCEL) unless both directions have ended, wakes
    /// any blocked reader and returns the stream's slot.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream_id = self.stream_id();
        let complete =
            self.state.end_stream_received() && self.local_finished.load(Ordering::Acquire);
        if stream_id != 0 && !complete && !self.state.stream_state().is_closed() {
            debug!(stream_id, "cancelling incomplete stream");
            self.discard_outbound.store(true, Ordering::Release);
            self.mux.queue_rst(stream_id, ErrorCode::Cancel.as_u32());
        }
        self.disarm_read_deadline();
        self.state.set_read_state_done();
        self.readable.notify_all();
        self.mux.release_stream(self);

        if self.discards_outbound() {
            while self.pending.pop().is_some() {}
        }
    }
}

impl fmt::Debug for ExchangeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeInner")
            .field("stream_id", &self.stream_id())
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Caller handle for one request/response exchange
///
/// Accessors block until the data they return is available, the stream
/// fails, or the connection dies.
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

impl Exchange {
    pub(crate) fn new(inner: Arc<ExchangeInner>) -> Self {
        Exchange { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ExchangeInner> {
        &self.inner
    }

    /// Stream id assigned when HEADERS was written (0 before that)
    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id()
    }

    pub fn request(&self) -> &HttpRequest {
        self.inner.request()
    }

    /// Response status, waiting for the final response HEADERS
    pub fn status(&self) -> Result<u16> {
        self.inner.response_headers().map(|(status, _)| status)
    }

    /// Response headers, waiting for the final response HEADERS
    pub fn headers(&self) -> Result<Headers> {
        self.inner.response_headers().map(|(_, headers)| headers)
    }

    /// Response trailers, waiting for the end of the response
    pub fn trailers(&self) -> Result<Option<Headers>> {
        self.inner.trailers()
    }

    /// 1xx responses received so far
    pub fn informational_responses(&self) -> Vec<InformationalResponse> {
        self.inner.informational()
    }

    /// Queue request body bytes
    pub fn write_data(&self, data: &[u8], end_stream: bool) -> Result<()> {
        self.inner.write_data(data, end_stream)
    }

    /// Queue request trailers; ends the request side
    pub fn write_trailers(&self, trailers: Headers) -> Result<()> {
        self.inner.write_trailers(trailers)
    }

    /// End the request side (sends the request's trailers if it has any)
    pub fn finish(&self) -> Result<()> {
        self.inner.finish()
    }

    /// Move buffered response chunks into `dest`; `None` at end of stream
    pub fn drain_chunks(&self, dest: &mut VecDeque<PooledBuf>, max_chunks: usize) -> Result<Option<usize>> {
        self.inner.drain_chunks(dest, max_chunks)
    }

    /// Writer for a streaming request body
    pub fn request_body(&self) -> RequestBody<'_> {
        RequestBody { exchange: self }
    }

    /// Reader over the response body
    pub fn response_body(&self) -> ResponseBody<'_> {
        ResponseBody {
            exchange: self,
            chunks: VecDeque::new(),
            pos: 0,
        }
    }

    /// Stream state snapshot
    pub fn state(&self) -> &PackedStreamState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the stream, cancelling it if incomplete
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// `Write` adapter for a streaming request body
pub struct RequestBody<'a> {
    exchange: &'a Exchange,
}

impl RequestBody<'_> {
    /// End the request body
    pub fn finish(self) -> Result<()> {
        self.exchange.finish()
    }
}

impl Write for RequestBody<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.exchange.write_data(buf, false)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `Read` adapter over the response body
pub struct ResponseBody<'a> {
    exchange: &'a Exchange,
    chunks: VecDeque<PooledBuf>,
    pos: usize,
}

impl Read for ResponseBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(chunk) = self.chunks.front() {
                let n = (chunk.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&chunk[self.pos..self.pos + n]);
                self.pos += n;
                if self.pos == chunk.len() {
                    self.chunks.pop_front();
                    self.pos = 0;
                }
                return Ok(n);
            }
            if self
                .exchange
                .drain_chunks(&mut self.chunks, READ_BATCH_CHUNKS)?
                .is_none()
            {
                return Ok(0);
            }
        }
    }
}
