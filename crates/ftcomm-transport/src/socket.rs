//! The byte pipe underneath a link: a TCP stream, optionally wrapped in TLS.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

use crate::config::KeepaliveOptions;
use crate::error::{Result, TransportError};
use crate::framing::classify_io;
use crate::tls::TlsSession;

/// A connected socket plus its TLS session, if any.
pub struct LinkSocket {
    stream: TcpStream,
    tls: Option<Box<dyn TlsSession>>,
}

impl std::fmt::Debug for LinkSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSocket")
            .field("fd", &self.stream.as_raw_fd())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl LinkSocket {
    pub fn new(stream: TcpStream, tls: Option<Box<dyn TlsSession>>) -> Self {
        Self { stream, tls }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether TLS holds ciphertext that still has to reach the socket.
    pub fn wants_write(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.wants_write())
    }

    /// Pushes buffered TLS records; `Ok(true)` when nothing is left.
    pub fn flush_tls(&mut self) -> io::Result<bool> {
        match self.tls.as_mut() {
            Some(tls) => tls.flush_pending(&self.stream),
            None => Ok(true),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Read and write timeouts for the blocking phase.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    pub fn apply_keepalive(&self, options: &KeepaliveOptions) -> Result<()> {
        apply_keepalive(&self.stream, options)
    }

    pub fn set_tls(&mut self, tls: Box<dyn TlsSession>) {
        self.tls = Some(tls);
    }

    /// Sends TLS close-notify and shuts the stream down; the fd closes on drop.
    pub fn shutdown(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.shutdown(&self.stream);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Writes all of `data`, blocking as needed.
    pub fn block_send(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.write(data) {
                Ok(0) => return Err(TransportError::LinkBroken),
                Ok(n) => data = &data[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io(err)),
            }
        }
        loop {
            match self.flush_tls() {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io(err)),
            }
        }
    }

    /// Fills all of `buf`, blocking as needed.
    pub fn block_recv(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::LinkBroken),
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io(err)),
            }
        }
        Ok(())
    }
}

impl Read for LinkSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.tls.as_mut() {
            Some(tls) => tls.read(&self.stream, buf),
            None => (&self.stream).read(buf),
        }
    }
}

impl Write for LinkSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tls.as_mut() {
            Some(tls) => tls.write(&self.stream, buf),
            None => (&self.stream).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_tls().map(|_| ())
    }
}

/// Enables TCP keepalive with the configured idle, interval and probe count.
pub fn apply_keepalive(stream: &TcpStream, options: &KeepaliveOptions) -> Result<()> {
    let sock = SockRef::from(stream);
    if !options.enabled {
        sock.set_keepalive(false)?;
        return Ok(());
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(options.idle_secs as u64))
        .with_interval(Duration::from_secs(options.interval_secs as u64))
        .with_retries(options.probes);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (LinkSocket, LinkSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (LinkSocket::new(client, None), LinkSocket::new(server, None))
    }

    #[test]
    fn test_block_send_recv() {
        let (mut a, mut b) = pair();
        a.block_send(b"0123456789").unwrap();
        let mut buf = [0u8; 10];
        b.block_recv(&mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn test_block_recv_peer_closed() {
        let (a, mut b) = pair();
        drop(a);
        let mut buf = [0u8; 4];
        assert!(matches!(b.block_recv(&mut buf), Err(TransportError::LinkBroken)));
    }

    #[test]
    fn test_block_recv_timeout_needs_reconnect() {
        let (_a, mut b) = pair();
        b.set_timeouts(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 4];
        let err = b.block_recv(&mut buf).unwrap_err();
        assert!(err.is_reconnectable(), "got {err:?}");
    }

    #[test]
    fn test_keepalive_applies() {
        let (a, _b) = pair();
        a.apply_keepalive(&KeepaliveOptions::default()).unwrap();
        assert!(SockRef::from(a.stream()).keepalive().unwrap());
    }
}
