//! In-process TLS provider built on rustls.
//!
//! Sessions drive rustls by hand (`read_tls`, `process_new_packets`,
//! `write_tls`) so they fit the edge-triggered, non-blocking link engine.

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use super::helper::TlsMaterial;
use super::provider::{TlsProvider, TlsSession};
use super::TlsError;

fn provider_err(reason: impl Into<String>) -> TlsError {
    TlsError::Provider {
        reason: reason.into(),
    }
}

/// rustls-backed [`TlsProvider`] with mutual authentication and CRL checks.
pub struct RustlsTls {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl std::fmt::Debug for RustlsTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsTls").finish()
    }
}

impl RustlsTls {
    pub fn new(material: &TlsMaterial) -> Result<Self, TlsError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let key = material
            .key
            .as_ref()
            .ok_or_else(|| provider_err("rustls provider cannot use an encrypted private key"))?;

        let mut roots = RootCertStore::empty();
        for ca in &material.ca_certs {
            roots
                .add(ca.clone())
                .map_err(|e| provider_err(format!("failed to add CA cert: {e}")))?;
        }
        let roots = Arc::new(roots);

        let client_verifier = WebPkiClientVerifier::builder(roots.clone())
            .with_crls(material.crls.iter().cloned())
            .build()
            .map_err(|e| provider_err(format!("failed to build client verifier: {e}")))?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(material.cert_chain.clone(), key.clone_key())
            .map_err(|e| provider_err(format!("failed to set server cert: {e}")))?;

        let server_verifier = WebPkiServerVerifier::builder(roots)
            .with_crls(material.crls.iter().cloned())
            .build()
            .map_err(|e| provider_err(format!("failed to build server verifier: {e}")))?;
        let client = ClientConfig::builder()
            .with_webpki_verifier(server_verifier)
            .with_client_auth_cert(material.cert_chain.clone(), key.clone_key())
            .map_err(|e| provider_err(format!("failed to create client config: {e}")))?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}

impl TlsProvider for RustlsTls {
    fn name(&self) -> &'static str {
        "rustls"
    }

    fn accept(&self, sock: &TcpStream) -> Result<Box<dyn TlsSession>, TlsError> {
        let conn = ServerConnection::new(self.server.clone())
            .map_err(|e| handshake_err(format!("failed to create server session: {e}")))?;
        let mut conn = Conn::Server(conn);
        conn.handshake(sock)?;
        Ok(Box::new(RustlsSession { conn }))
    }

    fn connect(&self, sock: &TcpStream, server_name: &str) -> Result<Box<dyn TlsSession>, TlsError> {
        let name = match server_name.parse::<std::net::IpAddr>() {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(server_name.to_string())
                .map_err(|e| handshake_err(format!("invalid server name {server_name}: {e}")))?,
        };
        let conn = ClientConnection::new(self.client.clone(), name)
            .map_err(|e| handshake_err(format!("failed to create client session: {e}")))?;
        let mut conn = Conn::Client(conn);
        conn.handshake(sock)?;
        Ok(Box::new(RustlsSession { conn }))
    }
}

fn handshake_err(reason: impl Into<String>) -> TlsError {
    TlsError::Handshake {
        reason: reason.into(),
    }
}

enum Conn {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Conn {
    fn handshake(&mut self, sock: &TcpStream) -> Result<(), TlsError> {
        let mut io = sock;
        macro_rules! drive {
            ($c:expr) => {{
                while $c.is_handshaking() {
                    $c.complete_io(&mut io)?;
                }
                // Flush anything queued by the final flight (TLS 1.3 tickets).
                while $c.wants_write() {
                    $c.write_tls(&mut io)?;
                }
                Ok(())
            }};
        }
        let result: io::Result<()> = (|| match self {
            Conn::Server(c) => drive!(c),
            Conn::Client(c) => drive!(c),
        })();
        result.map_err(|e| handshake_err(e.to_string()))
    }

    fn read_tls(&mut self, sock: &TcpStream) -> io::Result<usize> {
        let mut io = sock;
        match self {
            Conn::Server(c) => c.read_tls(&mut io),
            Conn::Client(c) => c.read_tls(&mut io),
        }
    }

    fn write_tls(&mut self, sock: &TcpStream) -> io::Result<usize> {
        let mut io = sock;
        match self {
            Conn::Server(c) => c.write_tls(&mut io),
            Conn::Client(c) => c.write_tls(&mut io),
        }
    }

    fn process_new_packets(&mut self) -> io::Result<()> {
        let state = match self {
            Conn::Server(c) => c.process_new_packets(),
            Conn::Client(c) => c.process_new_packets(),
        };
        state
            .map(|_| ())
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Server(c) => c.reader().read(buf),
            Conn::Client(c) => c.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Server(c) => c.writer().write(buf),
            Conn::Client(c) => c.writer().write(buf),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Conn::Server(c) => c.wants_write(),
            Conn::Client(c) => c.wants_write(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Conn::Server(c) => c.send_close_notify(),
            Conn::Client(c) => c.send_close_notify(),
        }
    }
}

struct RustlsSession {
    conn: Conn,
}

impl TlsSession for RustlsSession {
    fn read(&mut self, sock: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.read_plaintext(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if self.conn.read_tls(sock)? == 0 {
                return Ok(0);
            }
            self.conn.process_new_packets()?;
            if self.conn.wants_write() {
                let _ = self.flush_pending(sock);
            }
        }
    }

    fn write(&mut self, sock: &TcpStream, buf: &[u8]) -> io::Result<usize> {
        self.flush_pending(sock)?;
        let n = self.conn.write_plaintext(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::from(ErrorKind::WouldBlock));
        }
        match self.flush_pending(sock) {
            Ok(_) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(n),
            Err(e) => Err(e),
        }
    }

    fn flush_pending(&mut self, sock: &TcpStream) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn shutdown(&mut self, sock: &TcpStream) {
        self.conn.send_close_notify();
        let _ = self.flush_pending(sock);
    }
}
