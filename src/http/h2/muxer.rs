//! Stream multiplexer and writer loop
//!
//! The `Muxer` owns everything on the write side of a connection: stream
//! admission, stream id allocation, the registry of live exchanges, the
//! connection send window, the buffer pool and the writer thread.
//!
//! Every outbound frame is written by the writer loop. Control frames and
//! HEADERS arrive as typed `WorkItem`s on a lock-free queue and are written
//! in batches with one flush per batch. Body data does not go through the
//! work queue: exchanges queue chunks on themselves and put themselves on a
//! separate data queue, which the loop drains after each control batch so
//! DATA interleaves with control frames instead of queueing behind them.
//!
//! The loop also keeps the coarse tick counter used for timeouts and sweeps
//! registered streams for expired read deadlines.

use super::codec::FrameWriter;
use super::config::ConnectionConfig;
use super::error::{Error, ErrorCode, Result};
use super::exchange::{ExchangeInner, Outbound};
use super::flow_control::FlowControlWindow;
use super::pool::BufferPool;
use super::registry::{RegistryEntry, StreamRegistry};
use super::request_headers::HeaderEncoder;
use super::settings::{RemoteSettings, SettingsDelta};
use super::{MAX_STREAM_ID, TIMEOUT_POLL_INTERVAL};
use crate::http::session::{SessionOps, SessionWriter};
use crate::http::HttpRequest;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Sleep between checks while waiting for queues or streams to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Work for the writer loop
pub(crate) enum WorkItem {
    /// Allocate a stream id, encode and write HEADERS, register the exchange
    EncodeHeaders {
        exchange: Arc<ExchangeInner>,
        end_stream: bool,
    },
    WriteRst {
        stream_id: u32,
        code: u32,
    },
    WriteGoaway {
        last_stream_id: u32,
        code: u32,
        debug: String,
    },
    WriteWindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    WriteSettingsAck,
    WritePing {
        ack: bool,
        data: [u8; 8],
    },
    /// Wake-up marker; the data queue is drained on every iteration anyway
    CheckDataQueue,
    Shutdown,
}

struct WorkEntry {
    item: WorkItem,
    /// Tick by which the item must have been taken off the queue (0 = none)
    deadline_tick: u32,
}

/// Write-side coordinator for one connection
pub struct Muxer {
    name: String,
    registry: StreamRegistry<ExchangeInner>,
    remote: RemoteSettings,
    send_window: FlowControlWindow,
    pool: BufferPool,
    stream_recv_window: u32,
    read_timeout: Duration,
    write_timeout: Duration,

    active_streams: AtomicU32,
    next_stream_id: AtomicU32,
    last_stream_id: AtomicU32,
    accepting: AtomicBool,
    running: AtomicBool,
    goaway_received: AtomicBool,
    goaway_last_stream_id: AtomicU32,
    terminal: Mutex<Option<Error>>,
    /// Orders SETTINGS application against stream registration
    settings_lock: Mutex<()>,

    work: SegQueue<WorkEntry>,
    data_work: SegQueue<Arc<ExchangeInner>>,
    data_work_pending: AtomicBool,
    /// MAX_FRAME_SIZE from the peer not yet applied by the writer (0 = none)
    pending_max_frame_size: AtomicU32,
    /// HEADER_TABLE_SIZE from the peer not yet applied by the writer (-1 = none)
    pending_table_size: AtomicI64,

    tick: AtomicU32,
    last_activity_tick: AtomicU32,
    writer_thread: OnceLock<Thread>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    writer_exited: AtomicBool,
}

impl Muxer {
    pub fn new(config: &ConnectionConfig, name: &str) -> Arc<Self> {
        Arc::new(Muxer {
            name: name.to_string(),
            registry: StreamRegistry::new(),
            remote: RemoteSettings::new(),
            send_window: FlowControlWindow::new(super::DEFAULT_INITIAL_WINDOW_SIZE),
            pool: BufferPool::new(config.pool_max_buffers, config.pool_default_buffer_size),
            stream_recv_window: config.initial_window_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            active_streams: AtomicU32::new(0),
            next_stream_id: AtomicU32::new(1),
            last_stream_id: AtomicU32::new(0),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
            goaway_received: AtomicBool::new(false),
            goaway_last_stream_id: AtomicU32::new(MAX_STREAM_ID),
            terminal: Mutex::new(None),
            settings_lock: Mutex::new(()),
            work: SegQueue::new(),
            data_work: SegQueue::new(),
            data_work_pending: AtomicBool::new(false),
            pending_max_frame_size: AtomicU32::new(0),
            pending_table_size: AtomicI64::new(-1),
            tick: AtomicU32::new(0),
            last_activity_tick: AtomicU32::new(0),
            writer_thread: OnceLock::new(),
            writer_handle: Mutex::new(None),
            writer_exited: AtomicBool::new(false),
        })
    }

    /// Spawn the writer loop over `frames`
    pub(crate) fn start(self: &Arc<Self>, frames: FrameWriter<SessionWriter>) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let writer = WriterLoop {
            mux: self.clone(),
            frames,
            encoder: HeaderEncoder::new(),
            batch: Vec::with_capacity(64),
            last_sweep: Instant::now(),
        };
        let handle = thread::Builder::new()
            .name(format!("h2-writer-{}", self.name))
            .spawn(move || writer.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                Error::from(e)
            })?;
        let _ = self.writer_thread.set(handle.thread().clone());
        *self.writer_handle.lock() = Some(handle);
        Ok(())
    }

    pub fn remote(&self) -> &RemoteSettings {
        &self.remote
    }

    /// Connection-level send window
    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn exchange(&self, stream_id: u32) -> Option<Arc<ExchangeInner>> {
        self.registry.get(stream_id)
    }

    pub fn active_streams(&self) -> u32 {
        self.active_streams.load(Ordering::Acquire)
    }

    /// Highest stream id allocated so far
    pub fn last_stream_id(&self) -> u32 {
        self.last_stream_id.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn goaway_received(&self) -> bool {
        self.goaway_received.load(Ordering::Acquire)
    }

    /// The error that ended the connection, if it has ended
    pub fn terminal_error(&self) -> Option<Error> {
        self.terminal.lock().clone()
    }

    /// Record why the connection ended; the first cause wins
    pub(crate) fn set_terminal(&self, error: Error) {
        let mut terminal = self.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(error);
        }
    }

    pub fn current_tick(&self) -> u32 {
        self.tick.load(Ordering::Acquire)
    }

    /// Tick at which `timeout` from now expires; 0 for no timeout
    pub fn deadline_tick(&self, timeout: Duration) -> u32 {
        if timeout.is_zero() {
            return 0;
        }
        let interval = TIMEOUT_POLL_INTERVAL.as_millis();
        let ticks = timeout.as_millis().div_ceil(interval).min(u128::from(u32::MAX / 2)) as u32;
        self.current_tick().wrapping_add(ticks).max(1)
    }

    // ---- admission --------------------------------------------------------

    /// Reserve a stream slot and create the exchange for `request`
    ///
    /// The stream id is assigned later, when the writer loop writes HEADERS.
    pub(crate) fn new_exchange(self: &Arc<Self>, request: HttpRequest) -> Result<Arc<ExchangeInner>> {
        if !self.is_accepting() {
            return Err(Error::NotAccepting("connection is not accepting new streams".to_string()));
        }
        if self.goaway_received()
            && self.next_stream_id.load(Ordering::Acquire)
                > self.goaway_last_stream_id.load(Ordering::Acquire)
        {
            return Err(Error::NotAccepting("GOAWAY received".to_string()));
        }

        let limit = self.remote.max_concurrent_streams();
        self.active_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .map_err(|active| Error::TooManyStreams { active, limit })?;
        self.touch_activity();

        Ok(Arc::new(ExchangeInner::new(
            self.clone(),
            request,
            self.remote.initial_window_size(),
            self.stream_recv_window,
            self.read_timeout,
            self.write_timeout,
        )))
    }

    /// Hand the exchange's HEADERS to the writer loop
    pub(crate) fn submit_headers(&self, exchange: &Arc<ExchangeInner>, end_stream: bool) -> Result<()> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        if !self.is_accepting() {
            return Err(Error::NotAccepting("connection is not accepting new streams".to_string()));
        }
        self.enqueue(WorkItem::EncodeHeaders {
            exchange: exchange.clone(),
            end_stream,
        });
        Ok(())
    }

    fn allocate_stream_id(&self) -> Result<u32> {
        let stream_id = self.next_stream_id.load(Ordering::Acquire);
        if stream_id > MAX_STREAM_ID {
            self.accepting.store(false, Ordering::Release);
            return Err(Error::NotAccepting("stream ids exhausted".to_string()));
        }
        self.next_stream_id.store(stream_id + 2, Ordering::Release);
        self.last_stream_id.store(stream_id, Ordering::Release);
        if stream_id + 2 > MAX_STREAM_ID {
            debug!(name = %self.name, stream_id, "last stream id allocated");
            self.accepting.store(false, Ordering::Release);
        }
        Ok(stream_id)
    }

    /// Make a stream visible to the reader loop
    ///
    /// The send window is re-read from the peer's settings here, so a
    /// SETTINGS frame that arrived after admission is not missed.
    fn register(&self, exchange: &Arc<ExchangeInner>) {
        let _guard = self.settings_lock.lock();
        self.registry.put(exchange.clone());
        exchange
            .send_window()
            .reset(self.remote.initial_window_size());
    }

    /// Unregister the exchange and return its slot
    pub(crate) fn release_stream(&self, exchange: &ExchangeInner) {
        let stream_id = exchange.stream_id();
        if stream_id != 0 {
            self.registry.remove(stream_id);
        }
        self.release_slot(exchange);
    }

    fn release_slot(&self, exchange: &ExchangeInner) {
        if exchange.take_slot() {
            let _ = self
                .active_streams
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
            self.touch_activity();
        }
    }

    fn touch_activity(&self) {
        self.last_activity_tick
            .store(self.current_tick(), Ordering::Release);
    }

    /// Whether another stream would be admitted right now
    pub fn can_accept_more_streams(&self) -> bool {
        self.active_stream_count_if_accepting().is_some_and(|active| {
            active < self.remote.max_concurrent_streams()
        })
    }

    /// Active streams, or `None` if the connection takes no new streams
    pub fn active_stream_count_if_accepting(&self) -> Option<u32> {
        if !self.is_accepting() || self.goaway_received() || self.terminal_error().is_some() {
            return None;
        }
        let active = self.active_streams();
        (active < self.remote.max_concurrent_streams()).then_some(active)
    }

    /// Time since the last stream finished; zero while any stream is active
    pub fn idle_time_nanos(&self) -> u64 {
        if self.active_streams() > 0 {
            return 0;
        }
        let idle_ticks = self
            .current_tick()
            .saturating_sub(self.last_activity_tick.load(Ordering::Acquire));
        u64::from(idle_ticks) * TIMEOUT_POLL_INTERVAL.as_nanos() as u64
    }

    // ---- work queue -------------------------------------------------------

    fn enqueue(&self, item: WorkItem) {
        if self.writer_exited.load(Ordering::SeqCst) {
            self.discard(item);
            return;
        }
        self.work.push(WorkEntry {
            item,
            deadline_tick: self.deadline_tick(self.write_timeout),
        });
        if self.writer_exited.load(Ordering::SeqCst) {
            // Lost the race with the exiting writer
            self.fail_pending_work(&self.exit_cause());
            return;
        }
        self.unpark_writer();
    }

    /// Drop an item nobody will write
    fn discard(&self, item: WorkItem) {
        trace!(name = %self.name, "writer gone, dropping work item");
        if let WorkItem::EncodeHeaders { exchange, .. } = item {
            exchange.headers_written(Err(self.exit_cause()));
        }
    }

    fn exit_cause(&self) -> Error {
        self.terminal_error().unwrap_or(Error::ConnectionClosed)
    }

    fn unpark_writer(&self) {
        if let Some(thread) = self.writer_thread.get() {
            thread.unpark();
        }
    }

    pub(crate) fn queue_rst(&self, stream_id: u32, code: u32) {
        self.enqueue(WorkItem::WriteRst { stream_id, code });
    }

    pub(crate) fn queue_window_update(&self, stream_id: u32, increment: u32) {
        self.enqueue(WorkItem::WriteWindowUpdate {
            stream_id,
            increment,
        });
    }

    pub(crate) fn queue_goaway(&self, last_stream_id: u32, code: u32, debug: String) {
        self.enqueue(WorkItem::WriteGoaway {
            last_stream_id,
            code,
            debug,
        });
    }

    pub(crate) fn queue_settings_ack(&self) {
        self.enqueue(WorkItem::WriteSettingsAck);
    }

    pub(crate) fn queue_ping(&self, ack: bool, data: [u8; 8]) {
        self.enqueue(WorkItem::WritePing { ack, data });
    }

    /// Put the exchange on the data queue and wake the writer
    pub(crate) fn signal_data_ready(&self, exchange: &Arc<ExchangeInner>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if exchange.mark_data_queued() {
            self.data_work.push(exchange.clone());
        }
        if !self.data_work_pending.swap(true, Ordering::AcqRel) {
            self.enqueue(WorkItem::CheckDataQueue);
        } else {
            self.unpark_writer();
        }
    }

    // ---- peer events ------------------------------------------------------

    /// Apply a peer SETTINGS frame and propagate the changes
    ///
    /// An INITIAL_WINDOW_SIZE change reaches every registered stream.
    /// Streams registered concurrently take the new value when they are
    /// registered, never both.
    pub(crate) fn apply_settings(&self, pairs: &[(u16, u32)]) -> Result<()> {
        let _guard = self.settings_lock.lock();
        let delta = self.remote.apply(pairs)?;
        self.on_settings(delta)
    }

    fn on_settings(&self, delta: SettingsDelta) -> Result<()> {
        if let Some(delta) = delta.initial_window_delta.filter(|d| *d != 0) {
            let mut result = Ok(());
            self.registry.for_each(|exchange| {
                if let Err(err) = exchange.adjust_send_window(delta) {
                    result = Err(err);
                }
            });
            result?;
        }
        if let Some(size) = delta.max_frame_size {
            self.pending_max_frame_size.store(size, Ordering::Release);
        }
        if let Some(size) = delta.header_table_size {
            self.pending_table_size
                .store(i64::from(size), Ordering::Release);
        }
        if let Some(max) = delta.max_concurrent_streams {
            debug!(name = %self.name, max, "peer concurrent stream limit");
        }
        self.unpark_writer();
        Ok(())
    }

    /// Stop admitting streams and refuse every stream above `last_stream_id`
    pub(crate) fn on_goaway(&self, last_stream_id: u32, code: u32) {
        self.goaway_last_stream_id
            .store(last_stream_id, Ordering::Release);
        self.goaway_received.store(true, Ordering::Release);
        self.accepting.store(false, Ordering::Release);

        self.registry.for_each_matching(
            |stream_id| stream_id > last_stream_id,
            |exchange| {
                let stream_id = exchange.stream_id();
                debug!(name = %self.name, stream_id, last_stream_id, "stream refused by GOAWAY");
                exchange.signal_error(Error::RefusedStream {
                    stream_id,
                    last_stream_id,
                    code,
                });
                self.release_stream(exchange);
            },
        );
    }

    /// WINDOW_UPDATE on stream 0
    pub(crate) fn release_connection_window(&self, increment: u32) -> Result<()> {
        self.send_window.release(increment)
    }

    // ---- timeouts ---------------------------------------------------------

    /// Fail streams whose read deadline passed without activity
    fn check_read_timeouts(&self, tick: u32) {
        self.registry.for_each(|exchange| {
            let seq = exchange.read_seq();
            let deadline = exchange.read_deadline_tick();
            if deadline == 0 || tick < deadline {
                return;
            }
            // Data may have arrived between the two loads above
            if exchange.read_seq() != seq || exchange.read_deadline_tick() != deadline {
                return;
            }
            if !exchange.mark_read_timed_out() {
                return;
            }
            let stream_id = exchange.stream_id();
            debug!(name = %self.name, stream_id, "read timeout");
            exchange.signal_error(Error::ReadTimeout { stream_id });
            self.queue_rst(stream_id, ErrorCode::Cancel.as_u32());
            self.release_stream(exchange);
        });
    }

    // ---- teardown ---------------------------------------------------------

    /// Fail everything still queued for the writer
    fn fail_pending_work(&self, error: &Error) {
        while let Some(entry) = self.work.pop() {
            if let WorkItem::EncodeHeaders { exchange, .. } = entry.item {
                exchange.headers_written(Err(error.clone()));
            }
        }
        while let Some(exchange) = self.data_work.pop() {
            exchange.clear_data_queued();
            while exchange.pop_outbound().is_some() {}
        }
    }

    fn fail_writer(&self, error: Error) {
        self.set_terminal(error.clone());
        self.accepting.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.fail_pending_work(&error);
    }

    /// Fail and unregister every exchange with `error`
    pub(crate) fn fail_all(&self, error: &Error) {
        self.accepting.store(false, Ordering::Release);
        self.registry.clear_and_close(|exchange| {
            exchange.signal_error(error.clone());
            self.release_slot(&exchange);
        });
        self.fail_pending_work(error);
    }

    /// Tell every exchange the connection is closing, give them `grace` to
    /// finish, then force-close the rest
    pub(crate) fn close_exchanges(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        self.registry
            .for_each(|exchange| exchange.signal_error(Error::ConnectionClosed));

        let deadline = Instant::now() + grace;
        while self.active_streams() > 0 && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        self.registry.clear_and_close(|exchange| {
            exchange.close();
            self.release_slot(&exchange);
        });
    }

    /// Stop the writer after it has written what is queued
    ///
    /// Waits up to `drain` for the work queue to empty, then joins the
    /// writer thread.
    pub(crate) fn close(&self, drain: Duration) {
        self.accepting.store(false, Ordering::Release);
        self.unpark_writer();
        let deadline = Instant::now() + drain;
        while !self.work.is_empty()
            && !self.writer_exited.load(Ordering::Acquire)
            && Instant::now() < deadline
        {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        self.shutdown_now();
        self.join_writer();
        self.set_terminal(Error::ConnectionClosed);
        self.fail_pending_work(&Error::ConnectionClosed);
    }

    /// Ask the writer to stop after its current batch, without waiting
    pub(crate) fn shutdown_now(&self) {
        self.accepting.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        if self.writer_exited.load(Ordering::SeqCst) {
            return;
        }
        self.work.push(WorkEntry {
            item: WorkItem::Shutdown,
            deadline_tick: 0,
        });
        self.unpark_writer();
    }

    /// Wait up to `timeout` for the writer thread to finish
    pub(crate) fn wait_writer_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.writer_exited.load(Ordering::Acquire) || self.writer_thread.get().is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    fn join_writer(&self) {
        let handle = self.writer_handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("name", &self.name)
            .field("active_streams", &self.active_streams())
            .field("accepting", &self.is_accepting())
            .field("last_stream_id", &self.last_stream_id())
            .finish()
    }
}

/// State owned by the writer thread
struct WriterLoop {
    mux: Arc<Muxer>,
    frames: FrameWriter<SessionWriter>,
    encoder: HeaderEncoder,
    batch: Vec<WorkItem>,
    last_sweep: Instant,
}

impl WriterLoop {
    fn run(mut self) {
        debug!(name = %self.mux.name, "writer loop started");
        match self.run_loop() {
            Ok(()) => {
                let _ = self.frames.flush();
                debug!(name = %self.mux.name, "writer loop exited");
            }
            Err(err) => {
                warn!(name = %self.mux.name, error = %err, "writer loop failed");
                self.mux.fail_writer(err);
                // Unblocks the reader loop, which tears the connection down
                let _ = self.frames.get_ref().0.close();
            }
        }
        self.mux.writer_exited.store(true, Ordering::SeqCst);
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            self.sweep_if_due();
            self.apply_peer_settings();

            let mut shutdown = false;
            while let Some(entry) = self.mux.work.pop() {
                if entry.deadline_tick != 0 && self.mux.current_tick() >= entry.deadline_tick {
                    let err = Error::WriterStalled {
                        waited_ms: self.mux.write_timeout.as_millis() as u64,
                    };
                    if let WorkItem::EncodeHeaders { exchange, .. } = entry.item {
                        exchange.headers_written(Err(err.clone()));
                    }
                    return Err(err);
                }
                match entry.item {
                    WorkItem::Shutdown => {
                        shutdown = true;
                        break;
                    }
                    WorkItem::CheckDataQueue => {}
                    item => self.batch.push(item),
                }
            }
            if !self.batch.is_empty() {
                self.process_batch()?;
            }
            if shutdown {
                return Ok(());
            }

            self.mux.data_work_pending.store(false, Ordering::Release);
            let mut wrote_data = false;
            while let Some(exchange) = self.mux.data_work.pop() {
                wrote_data |= self.write_pending(&exchange)?;
            }
            if wrote_data {
                self.frames.flush()?;
            }

            if !self.mux.running.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.mux.work.is_empty() && self.mux.data_work.is_empty() {
                thread::park_timeout(TIMEOUT_POLL_INTERVAL);
            }
        }
    }

    fn sweep_if_due(&mut self) {
        let elapsed = self.last_sweep.elapsed();
        if elapsed < TIMEOUT_POLL_INTERVAL {
            return;
        }
        let ticks = (elapsed.as_millis() / TIMEOUT_POLL_INTERVAL.as_millis()) as u32;
        self.last_sweep += TIMEOUT_POLL_INTERVAL * ticks;
        let tick = self.mux.tick.fetch_add(ticks, Ordering::AcqRel).wrapping_add(ticks);
        self.mux.check_read_timeouts(tick);
    }

    fn apply_peer_settings(&mut self) {
        let frame_size = self.mux.pending_max_frame_size.swap(0, Ordering::AcqRel);
        if frame_size != 0 {
            trace!(frame_size, "applying peer MAX_FRAME_SIZE");
            self.frames.set_max_frame_size(frame_size);
        }
        let table_size = self.mux.pending_table_size.swap(-1, Ordering::AcqRel);
        if table_size >= 0 {
            self.encoder.set_max_table_size(table_size as u32);
        }
    }

    /// Write a batch, flush once, then tell waiting callers
    fn process_batch(&mut self) -> Result<()> {
        let mut batch = std::mem::take(&mut self.batch);
        let mut written = Vec::new();
        let mut result = Ok(());

        let mut items = batch.drain(..);
        for item in items.by_ref() {
            if let Err(err) = self.process_item(item, &mut written) {
                result = Err(err);
                break;
            }
        }
        let unprocessed: Vec<WorkItem> = items.collect();
        if result.is_ok() {
            result = self.frames.flush();
        }

        match &result {
            Ok(()) => {
                for exchange in written {
                    exchange.headers_written(Ok(()));
                }
            }
            Err(err) => {
                for exchange in written {
                    exchange.headers_written(Err(err.clone()));
                }
                for item in unprocessed {
                    if let WorkItem::EncodeHeaders { exchange, .. } = item {
                        exchange.headers_written(Err(err.clone()));
                    }
                }
            }
        }
        self.batch = batch;
        result
    }

    fn process_item(&mut self, item: WorkItem, written: &mut Vec<Arc<ExchangeInner>>) -> Result<()> {
        match item {
            WorkItem::EncodeHeaders {
                exchange,
                end_stream,
            } => match self.encode_headers(&exchange, end_stream) {
                Ok(()) => written.push(exchange),
                Err(err) if err.is_connection_error() => {
                    exchange.headers_written(Err(err.clone()));
                    return Err(err);
                }
                Err(err) => exchange.headers_written(Err(err)),
            },
            WorkItem::WriteRst { stream_id, code } => {
                trace!(stream_id, code = %ErrorCode::name_of(code), "RST_STREAM");
                self.frames.write_rst_stream(stream_id, code)?;
            }
            WorkItem::WriteGoaway {
                last_stream_id,
                code,
                debug,
            } => {
                debug!(name = %self.mux.name, last_stream_id, code = %ErrorCode::name_of(code), "sending GOAWAY");
                self.frames
                    .write_goaway(last_stream_id, code, debug.as_bytes())?;
            }
            WorkItem::WriteWindowUpdate {
                stream_id,
                increment,
            } => {
                trace!(stream_id, increment, "WINDOW_UPDATE");
                self.frames.write_window_update(stream_id, increment)?;
            }
            WorkItem::WriteSettingsAck => self.frames.write_settings_ack()?,
            WorkItem::WritePing { ack, data } => self.frames.write_ping(ack, data)?,
            WorkItem::CheckDataQueue | WorkItem::Shutdown => {}
        }
        Ok(())
    }

    fn encode_headers(&mut self, exchange: &Arc<ExchangeInner>, end_stream: bool) -> Result<()> {
        if !self.mux.is_accepting() {
            return Err(Error::NotAccepting("connection is not accepting new streams".to_string()));
        }
        if exchange.is_closed() {
            return Err(Error::Cancelled(0));
        }
        let block = self
            .encoder
            .encode_request(exchange.request(), self.mux.remote.max_header_list_size())?;

        let stream_id = self.mux.allocate_stream_id()?;
        exchange.assign_stream_id(stream_id);
        self.mux.register(exchange);
        exchange.state().on_headers_encoded(end_stream);

        if let Err(err) = self.frames.write_headers(stream_id, &block, end_stream) {
            self.mux.release_stream(exchange);
            return Err(err);
        }
        trace!(stream_id, end_stream, len = block.len(), "HEADERS");
        if exchange.is_closed() {
            // Closed by the caller while we were registering it
            self.frames
                .write_rst_stream(stream_id, ErrorCode::Cancel.as_u32())?;
            self.mux.release_stream(exchange);
        }
        Ok(())
    }

    /// Write everything queued on one exchange, in order
    fn write_pending(&mut self, exchange: &Arc<ExchangeInner>) -> Result<bool> {
        exchange.clear_data_queued();
        let stream_id = exchange.stream_id();
        let mut wrote = false;
        while let Some(outbound) = exchange.pop_outbound() {
            if exchange.discards_outbound() {
                continue;
            }
            match outbound {
                Outbound::Data { buf, end_stream } => {
                    let max = self.frames.max_frame_size() as usize;
                    if buf.len() <= max {
                        self.frames.write_data(stream_id, &buf, end_stream)?;
                    } else {
                        // Peer lowered MAX_FRAME_SIZE after the chunk was cut
                        let mut chunks = buf.chunks(max).peekable();
                        while let Some(chunk) = chunks.next() {
                            let last = chunks.peek().is_none();
                            self.frames
                                .write_data(stream_id, chunk, end_stream && last)?;
                        }
                    }
                    if end_stream {
                        exchange.state().mark_end_stream_sent();
                    }
                }
                Outbound::Trailers(trailers) => {
                    match self.encoder.encode_trailers(stream_id, &trailers) {
                        Ok(block) => {
                            self.frames.write_headers(stream_id, &block, true)?;
                            exchange.state().mark_end_stream_sent();
                        }
                        Err(err) => {
                            exchange.signal_error(err.clone());
                            self.frames.write_rst_stream(stream_id, err.code())?;
                            self.mux.release_stream(exchange);
                        }
                    }
                }
            }
            wrote = true;
        }
        Ok(wrote)
    }
}
