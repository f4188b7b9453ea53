use std::io;
use std::net::TcpStream;

use super::TlsError;

/// An established TLS session bound to one socket.
///
/// `read` and `write` report `WouldBlock` when the engine needs the socket to
/// become readable or writable; `Ok(0)` from `read` means the peer closed.
pub trait TlsSession: Send {
    fn read(&mut self, sock: &TcpStream, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, sock: &TcpStream, buf: &[u8]) -> io::Result<usize>;

    /// Pushes buffered ciphertext; returns `true` once nothing is pending.
    fn flush_pending(&mut self, sock: &TcpStream) -> io::Result<bool>;

    /// Whether ciphertext is still waiting for the socket.
    fn wants_write(&self) -> bool;

    /// Best-effort close notification.
    fn shutdown(&mut self, sock: &TcpStream);
}

/// Creates sessions over connected sockets.
///
/// Both handshakes run on a blocking socket.
pub trait TlsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn accept(&self, sock: &TcpStream) -> Result<Box<dyn TlsSession>, TlsError>;

    fn connect(&self, sock: &TcpStream, server_name: &str) -> Result<Box<dyn TlsSession>, TlsError>;
}
