//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! An HTTP/2 connection drives its session from two threads at once: the
//! reader loop blocks in `read` while the writer loop calls `write` and
//! `flush`. Every operation therefore takes `&self`, and implementations
//! must tolerate one concurrent reader plus one concurrent writer.

use super::Result;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps: Send + Sync + 'static {
    /// Read data from the session
    ///
    /// Returns `Ok(0)` on end of stream. A read that exceeds the configured
    /// read timeout fails with `TimedOut` or `WouldBlock`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data to the session
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered output
    fn flush(&self) -> io::Result<()>;

    /// Set the timeout for subsequent reads (`None` blocks indefinitely)
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close the session, unblocking any pending read
    fn close(&self) -> io::Result<()>;

    /// Application protocol negotiated during the handshake (ALPN)
    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        None
    }
}

impl SessionOps for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Whether an I/O error is a read/write timeout rather than a failure
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Wait until `fd` is ready for the requested operation
///
/// Returns true if ready, false on timeout. `None` waits indefinitely.
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(result > 0);
    }
}

/// Open a TCP connection with `TCP_NODELAY` set
pub fn tcp_connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

/// `io::Read` adapter over a shared session
pub struct SessionReader(pub Arc<dyn SessionOps>);

impl Read for SessionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// `io::Write` adapter over a shared session
pub struct SessionWriter(pub Arc<dyn SessionOps>);

impl Write for SessionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
