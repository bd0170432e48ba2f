//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::H2_ALPN;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result};
use openssl::ssl::{ErrorCode, SslConnector, SslMethod, SslStream, SslVerifyMode};
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const NO_TIMEOUT: u64 = u64::MAX;

/// TLS session operations
///
/// Wraps an established OpenSSL `SslStream`. The SSL object is locked only
/// for the duration of one `ssl_read`/`ssl_write` call; readiness waits
/// happen outside the lock.
pub struct TlsSessionOps {
    stream: Mutex<SslStream<TcpStream>>,
    fd: RawFd,
    read_timeout_ms: AtomicU64,
    alpn: Option<Vec<u8>>,
    closed: AtomicBool,
}

/// What the SSL engine needs before an operation can be retried
enum Want {
    Read,
    Write,
}

impl TlsSessionOps {
    /// Wrap an established TLS stream
    pub fn new(stream: SslStream<TcpStream>) -> io::Result<Self> {
        stream.get_ref().set_nonblocking(true)?;
        let fd = stream.get_ref().as_raw_fd();
        let alpn = stream.ssl().selected_alpn_protocol().map(|p| p.to_vec());

        Ok(TlsSessionOps {
            stream: Mutex::new(stream),
            fd,
            read_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            alpn,
            closed: AtomicBool::new(false),
        })
    }

    /// Perform a client handshake offering `h2` via ALPN
    pub fn connect(tcp_stream: TcpStream, servername: &str, verify_peer: bool) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::Tls(e.to_string()))?;
        builder
            .set_alpn_protos(H2_ALPN)
            .map_err(|e| Error::Tls(e.to_string()))?;
        if !verify_peer {
            builder.set_verify(SslVerifyMode::NONE);
        }

        let config = builder
            .build()
            .configure()
            .map_err(|e| Error::Tls(e.to_string()))?
            .verify_hostname(verify_peer);

        let stream = config
            .connect(servername, tcp_stream)
            .map_err(|e| Error::Tls(format!("handshake failed: {}", e)))?;

        Ok(TlsSessionOps::new(stream)?)
    }

    /// Negotiated ALPN protocol
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_ms.load(Ordering::Relaxed) {
            NO_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn wait(&self, want: Want, timeout: Option<Duration>) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let events = match want {
            Want::Read => PollEvents::Read,
            Want::Write => PollEvents::Write,
        };
        if poll_fd(self.fd, events, timeout)? {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::TimedOut, "TLS session timed out"))
        }
    }
}

fn classify(err: openssl::ssl::Error) -> io::Result<Option<Want>> {
    match err.code() {
        ErrorCode::WANT_READ => Ok(Some(Want::Read)),
        ErrorCode::WANT_WRITE => Ok(Some(Want::Write)),
        ErrorCode::ZERO_RETURN => Ok(None),
        ErrorCode::SYSCALL if err.io_error().is_none() => Ok(None),
        _ => Err(err
            .into_io_error()
            .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e))),
    }
}

impl SessionOps for TlsSessionOps {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let result = self.stream.lock().ssl_read(buf);
            match result {
                Ok(n) => return Ok(n),
                Err(e) => match classify(e)? {
                    // close_notify or unexpected EOF
                    None => return Ok(0),
                    Some(want) => self.wait(want, self.read_timeout())?,
                },
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let result = self.stream.lock().ssl_write(buf);
            match result {
                Ok(n) => return Ok(n),
                Err(e) => match classify(e)? {
                    None => return Err(io::ErrorKind::WriteZero.into()),
                    Some(want) => self.wait(want, None)?,
                },
            }
        }
    }

    fn flush(&self) -> io::Result<()> {
        // ssl_write hands complete records to the socket
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let ms = timeout
            .map(|d| (d.as_millis() as u64).max(1))
            .unwrap_or(NO_TIMEOUT);
        self.read_timeout_ms.store(ms, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut stream = self.stream.lock();
        // Best effort close_notify; the socket is non-blocking
        let _ = stream.shutdown();
        match stream.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.alpn.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::ssl::{select_next_proto, AlpnError, SslAcceptor};
    use openssl::x509::{X509NameBuilder, X509};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn acceptor() -> SslAcceptor {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut cert = X509::builder().unwrap();
        cert.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        cert.set_serial_number(&serial).unwrap();
        cert.set_subject_name(&name).unwrap();
        cert.set_issuer_name(&name).unwrap();
        cert.set_pubkey(&key).unwrap();
        cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        cert.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = cert.build();

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        builder.set_private_key(&key).unwrap();
        builder.set_certificate(&cert).unwrap();
        builder.set_alpn_select_callback(|_, client| {
            select_next_proto(H2_ALPN, client).ok_or(AlpnError::NOACK)
        });
        builder.build()
    }

    #[test]
    fn test_tls_handshake_and_concurrent_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let mut tls = acceptor.accept(tcp).unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"Hello");
            tls.write_all(b"World").unwrap();
        });

        let tcp = TcpStream::connect(addr).unwrap();
        let session = Arc::new(TlsSessionOps::connect(tcp, "localhost", false).unwrap());
        assert_eq!(session.negotiated_protocol(), Some(b"h2".to_vec()));

        // Reader parks first; the writer must still get through
        let reader = {
            let session = session.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 5];
                let mut read = 0;
                while read < 5 {
                    let n = session.read(&mut buf[read..]).unwrap();
                    assert!(n > 0);
                    read += n;
                }
                buf
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(session.write(b"Hello").unwrap(), 5);

        assert_eq!(&reader.join().unwrap(), b"World");
        server.join().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn test_tls_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let _tls = acceptor.accept(tcp).unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let tcp = TcpStream::connect(addr).unwrap();
        let session = TlsSessionOps::connect(tcp, "localhost", false).unwrap();
        session.set_read_timeout(Some(Duration::from_millis(30))).unwrap();

        let mut buf = [0u8; 4];
        let err = session.read(&mut buf).unwrap_err();
        assert!(crate::http::session::is_timeout(&err));

        server.join().unwrap();
    }
}
