//! HTTP/2 frame encoding and decoding
//!
//! `FrameReader` owns the socket-facing read buffer and enforces the framing
//! rules of RFC 9113 Section 4 and 6 on everything it hands out. `FrameWriter`
//! owns the outbound buffer; frames accumulate there until `flush`, so the
//! writer loop pays for one socket flush per batch.
//!
//! The two halves are used from different threads. `FrameCodec` bundles them
//! for single-threaded use (the mock server in the integration tests).

use super::error::{Error, Result};
use super::frames::{Frame, FrameFlags, FrameHeader, FrameType};
use super::{CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Socket read granularity
const READ_CHUNK: usize = 16 * 1024;

/// Buffered output is pushed to the socket (without flushing) past this size
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R: Read, W: Write> FrameCodec<R, W> {
    /// Create a new frame codec over separate read and write halves
    pub fn new(reader: R, writer: W) -> Self {
        FrameCodec {
            reader: FrameReader::new(reader, DEFAULT_MAX_FRAME_SIZE),
            writer: FrameWriter::new(writer, DEFAULT_MAX_FRAME_SIZE),
        }
    }

    /// Read the next frame; `None` on clean end of stream
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.reader.read_frame()
    }

    /// Buffer one frame
    pub fn write_frame(
        &mut self,
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        self.writer.write_frame(frame_type, flags, stream_id, payload)
    }

    /// Buffer a header block, split into HEADERS + CONTINUATION as needed
    pub fn write_headers(&mut self, stream_id: u32, block: &[u8], end_stream: bool) -> Result<()> {
        self.writer.write_headers(stream_id, block, end_stream)
    }

    /// Write out everything buffered
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }

    /// Read half
    pub fn reader(&mut self) -> &mut FrameReader<R> {
        &mut self.reader
    }

    /// Write half
    pub fn writer(&mut self) -> &mut FrameWriter<W> {
        &mut self.writer
    }

    /// Separate the halves
    pub fn split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Read half of the codec
pub struct FrameReader<R> {
    inner: R,
    /// Bytes received but not yet consumed
    buf: BytesMut,
    /// Reused for control frame payloads
    scratch: BytesMut,
    max_frame_size: u32,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader accepting payloads up to `max_frame_size`
    pub fn new(inner: R, max_frame_size: u32) -> Self {
        FrameReader {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scratch: BytesMut::with_capacity(64),
            max_frame_size,
        }
    }

    /// Largest payload accepted before raising FRAME_SIZE_ERROR
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Underlying reader
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Read until at least `n` bytes are buffered
    ///
    /// Returns false if the peer closed first. Errors (including read
    /// timeouts) leave already buffered bytes in place, so a timed-out read
    /// can be retried without losing frame alignment.
    fn fill(&mut self, n: usize) -> Result<bool> {
        while self.buf.len() < n {
            let len = self.buf.len();
            let want = (n - len).max(READ_CHUNK);
            self.buf.resize(len + want, 0);
            match self.inner.read(&mut self.buf[len..]) {
                Ok(0) => {
                    self.buf.truncate(len);
                    return Ok(false);
                }
                Ok(read) => self.buf.truncate(len + read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.buf.truncate(len),
                Err(e) => {
                    self.buf.truncate(len);
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    fn fill_or_eof(&mut self, n: usize) -> Result<()> {
        if self.fill(n)? {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame").into())
        }
    }

    /// Read and validate the next frame header
    ///
    /// Returns `None` on a clean end of stream between frames. Checks the
    /// length limit, stream id requirements and fixed payload sizes.
    pub fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        if !self.fill(FRAME_HEADER_LEN)? {
            if self.buf.is_empty() {
                return Ok(None);
            }
            return Err(
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-header").into(),
            );
        }

        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let header = FrameHeader::decode(&raw);
        self.validate_header(&header)?;
        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(header))
    }

    fn validate_header(&self, header: &FrameHeader) -> Result<()> {
        if header.length > self.max_frame_size {
            return Err(Error::FrameSize(format!(
                "frame length {} exceeds maximum {}",
                header.length, self.max_frame_size
            )));
        }

        let Some(kind) = header.kind() else {
            return Ok(());
        };

        if kind.is_connection_only() && header.stream_id != 0 {
            return Err(Error::Protocol(format!(
                "{} frame on stream {}",
                kind.name(),
                header.stream_id
            )));
        }
        if kind.is_stream_only() && header.stream_id == 0 {
            return Err(Error::Protocol(format!("{} frame on stream 0", kind.name())));
        }

        let len = header.length;
        let size_ok = match kind {
            FrameType::Ping => len == 8,
            FrameType::WindowUpdate | FrameType::RstStream => len == 4,
            FrameType::Priority => len == 5,
            FrameType::Goaway => len >= 8,
            FrameType::Settings if header.flags.is_ack() => len == 0,
            FrameType::Settings => len % 6 == 0,
            _ => true,
        };
        if !size_ok {
            return Err(Error::FrameSize(format!(
                "invalid {} payload length {}",
                kind.name(),
                len
            )));
        }
        Ok(())
    }

    /// Fill `dst` with the next payload bytes
    pub fn read_payload_into(&mut self, dst: &mut [u8]) -> Result<()> {
        let from_buf = self.buf.len().min(dst.len());
        dst[..from_buf].copy_from_slice(&self.buf[..from_buf]);
        self.buf.advance(from_buf);
        if from_buf < dst.len() {
            self.inner.read_exact(&mut dst[from_buf..])?;
        }
        Ok(())
    }

    /// Discard the next `n` payload bytes
    pub fn skip(&mut self, n: usize) -> Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill_or_eof(1)?;
            }
            let step = remaining.min(self.buf.len());
            self.buf.advance(step);
            remaining -= step;
        }
        Ok(())
    }

    /// Read a single payload byte
    pub fn read_u8(&mut self) -> Result<u8> {
        self.fill_or_eof(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a DATA payload into `dst`, stripping padding
    ///
    /// `dst` must hold at least `header.length` bytes. Returns the number of
    /// data bytes written.
    pub fn read_data_into(&mut self, header: &FrameHeader, dst: &mut [u8]) -> Result<usize> {
        let len = header.length as usize;
        if !header.flags.is_padded() {
            self.read_payload_into(&mut dst[..len])?;
            return Ok(len);
        }
        if len == 0 {
            return Err(Error::Protocol("padded DATA frame without pad length".to_string()));
        }
        let pad = self.read_u8()? as usize;
        if pad >= len {
            return Err(Error::Protocol(format!(
                "pad length {} not less than payload length {}",
                pad, len
            )));
        }
        let data_len = len - 1 - pad;
        self.read_payload_into(&mut dst[..data_len])?;
        self.skip(pad)?;
        Ok(data_len)
    }

    fn read_payload(&mut self, header: &FrameHeader, kind: FrameType) -> Result<Bytes> {
        let len = header.length as usize;
        self.fill_or_eof(len)?;
        if kind.is_control() {
            // Capacity is reclaimed once the previous control payload is dropped
            self.scratch.clear();
            self.scratch.extend_from_slice(&self.buf[..len]);
            self.buf.advance(len);
            Ok(self.scratch.split().freeze())
        } else {
            let payload = Bytes::copy_from_slice(&self.buf[..len]);
            self.buf.advance(len);
            Ok(payload)
        }
    }

    /// Read the body of a frame whose header was returned by `read_header`
    ///
    /// Strips padding and priority fields. A HEADERS or PUSH_PROMISE without
    /// END_HEADERS is completed from the CONTINUATION frames that must follow
    /// it; the returned frame carries the whole block with END_HEADERS set.
    pub fn read_frame_body(&mut self, header: FrameHeader) -> Result<Frame> {
        let Some(kind) = header.kind() else {
            return Err(Error::Internal(format!(
                "read_frame_body called for unknown frame type 0x{:x}",
                header.frame_type
            )));
        };

        let mut payload = self.read_payload(&header, kind)?;

        match kind {
            FrameType::Data | FrameType::Headers | FrameType::PushPromise
                if header.flags.is_padded() =>
            {
                if payload.is_empty() {
                    return Err(Error::Protocol(format!("padded {} without pad length", kind.name())));
                }
                let pad = payload[0] as usize;
                if pad >= payload.len() {
                    return Err(Error::Protocol(format!(
                        "pad length {} not less than payload length {}",
                        pad,
                        payload.len()
                    )));
                }
                payload.advance(1);
                payload.truncate(payload.len() - pad);
            }
            _ => {}
        }

        if kind == FrameType::Headers && header.flags.is_priority() {
            if payload.len() < 5 {
                return Err(Error::FrameSize("HEADERS too short for priority fields".to_string()));
            }
            payload.advance(5);
        }

        if kind == FrameType::Continuation {
            return Err(Error::Protocol(format!(
                "CONTINUATION on stream {} without preceding HEADERS",
                header.stream_id
            )));
        }

        let mut flags = header.flags;
        if matches!(kind, FrameType::Headers | FrameType::PushPromise) && !flags.is_end_headers() {
            payload = self.read_continuations(header.stream_id, payload)?;
            flags.set(FrameFlags::END_HEADERS);
        }

        Ok(Frame::new(kind, flags, header.stream_id, payload))
    }

    fn read_continuations(&mut self, stream_id: u32, first: Bytes) -> Result<Bytes> {
        let mut block = BytesMut::from(&first[..]);
        loop {
            let next = self.read_header()?.ok_or_else(|| {
                Error::Protocol("connection closed inside header block".to_string())
            })?;
            if next.kind() != Some(FrameType::Continuation) || next.stream_id != stream_id {
                return Err(Error::Protocol(format!(
                    "expected CONTINUATION for stream {}, got frame type 0x{:x} on stream {}",
                    stream_id, next.frame_type, next.stream_id
                )));
            }
            let len = next.length as usize;
            self.fill_or_eof(len)?;
            block.extend_from_slice(&self.buf[..len]);
            self.buf.advance(len);
            if next.flags.is_end_headers() {
                return Ok(block.freeze());
            }
        }
    }

    /// Buffer the whole of the next frame before its header is consumed
    ///
    /// A read timeout here leaves the reader positioned on a frame boundary,
    /// so short opportunistic reads can give up without losing sync.
    /// Oversized frames are left for `read_header` to reject.
    pub fn prefetch_frame(&mut self) -> Result<()> {
        if !self.fill(FRAME_HEADER_LEN)? {
            return Ok(());
        }
        let len = ((self.buf[0] as usize) << 16) | ((self.buf[1] as usize) << 8) | self.buf[2] as usize;
        if len <= self.max_frame_size as usize {
            self.fill(FRAME_HEADER_LEN + len)?;
        }
        Ok(())
    }

    /// Read the next frame of a known type, skipping unknown types
    ///
    /// Returns `None` on a clean end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            self.prefetch_frame()?;
            let Some(header) = self.read_header()? else {
                return Ok(None);
            };
            if header.kind().is_none() {
                self.skip(header.length as usize)?;
                continue;
            }
            return self.read_frame_body(header).map(Some);
        }
    }

    /// Read and check the client connection preface (server side)
    pub fn read_preface(&mut self) -> Result<()> {
        self.fill_or_eof(CONNECTION_PREFACE.len())?;
        if &self.buf[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
            return Err(Error::Protocol("invalid connection preface".to_string()));
        }
        self.buf.advance(CONNECTION_PREFACE.len());
        Ok(())
    }
}

/// Write half of the codec
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
    max_frame_size: u32,
}

impl<W: Write> FrameWriter<W> {
    /// Create a writer that emits payloads up to `max_frame_size`
    pub fn new(inner: W, max_frame_size: u32) -> Self {
        FrameWriter {
            inner,
            buf: BytesMut::with_capacity(WRITE_HIGH_WATER),
            max_frame_size,
        }
    }

    /// Peer's maximum frame size
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Update the peer's maximum frame size
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Underlying writer
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Bytes buffered and not yet written
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn spill(&mut self) -> Result<()> {
        if self.buf.len() >= WRITE_HIGH_WATER {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Buffer one frame
    pub fn write_frame(
        &mut self,
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > self.max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "outbound {} payload {} exceeds peer maximum {}",
                frame_type.name(),
                payload.len(),
                self.max_frame_size
            )));
        }
        self.buf.reserve(FRAME_HEADER_LEN + payload.len());
        FrameHeader::new(frame_type, flags, stream_id, payload.len() as u32).encode(&mut self.buf);
        self.buf.put_slice(payload);
        self.spill()
    }

    /// Buffer a header block, split into HEADERS + CONTINUATION frames
    ///
    /// END_STREAM rides on the HEADERS frame; END_HEADERS only on the last
    /// frame of the sequence.
    pub fn write_headers(&mut self, stream_id: u32, block: &[u8], end_stream: bool) -> Result<()> {
        let max = self.max_frame_size as usize;
        let mut chunks = block.chunks(max.max(1));
        let first = chunks.next().unwrap_or(&[]);
        let mut rest = chunks.peekable();

        let mut flags = FrameFlags::empty();
        if end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if rest.peek().is_none() {
            flags.set(FrameFlags::END_HEADERS);
        }
        self.write_frame(FrameType::Headers, flags, stream_id, first)?;

        while let Some(chunk) = rest.next() {
            let flags = if rest.peek().is_none() {
                FrameFlags::from_u8(FrameFlags::END_HEADERS)
            } else {
                FrameFlags::empty()
            };
            self.write_frame(FrameType::Continuation, flags, stream_id, chunk)?;
        }
        Ok(())
    }

    /// Buffer a DATA frame
    pub fn write_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<()> {
        let flags = if end_stream {
            FrameFlags::from_u8(FrameFlags::END_STREAM)
        } else {
            FrameFlags::empty()
        };
        self.write_frame(FrameType::Data, flags, stream_id, data)
    }

    /// Buffer a SETTINGS frame
    pub fn write_settings(&mut self, params: &[(u16, u32)]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(params.len() * 6);
        for (id, value) in params {
            payload.put_u16(*id);
            payload.put_u32(*value);
        }
        self.write_frame(FrameType::Settings, FrameFlags::empty(), 0, &payload)
    }

    /// Buffer a SETTINGS ACK
    pub fn write_settings_ack(&mut self) -> Result<()> {
        self.write_frame(FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, &[])
    }

    /// Buffer a WINDOW_UPDATE
    pub fn write_window_update(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        let payload = (increment & 0x7FFF_FFFF).to_be_bytes();
        self.write_frame(FrameType::WindowUpdate, FrameFlags::empty(), stream_id, &payload)
    }

    /// Buffer a RST_STREAM
    pub fn write_rst_stream(&mut self, stream_id: u32, code: u32) -> Result<()> {
        self.write_frame(FrameType::RstStream, FrameFlags::empty(), stream_id, &code.to_be_bytes())
    }

    /// Buffer a GOAWAY
    pub fn write_goaway(&mut self, last_stream_id: u32, code: u32, debug: &[u8]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(8 + debug.len());
        payload.put_u32(last_stream_id & 0x7FFF_FFFF);
        payload.put_u32(code);
        payload.put_slice(debug);
        self.write_frame(FrameType::Goaway, FrameFlags::empty(), 0, &payload)
    }

    /// Buffer a PING
    pub fn write_ping(&mut self, ack: bool, data: [u8; 8]) -> Result<()> {
        let flags = if ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        self.write_frame(FrameType::Ping, flags, 0, &data)
    }

    /// Buffer the client connection preface
    pub fn write_preface(&mut self) -> Result<()> {
        self.buf.put_slice(CONNECTION_PREFACE);
        Ok(())
    }

    /// Write out everything buffered and flush the underlying writer
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()?;
        Ok(())
    }
}
