//! Controller-side endpoint: accepts connections from ranks.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::config::{parse_addr, ServerOptions};
use crate::connector::{dial_with_retry, Dial};
use crate::endpoint::{Endpoint, EndpointStats};
use crate::error::{Result, TransportError};
use crate::handler::{ConnectHook, LinkBrokenHook, RequestContext, SentNotice};
use crate::link::Link;
use crate::listener::{AcceptHandler, Listener};
use crate::protocol::{ConnectRequest, ConnectResult, MessageType};
use crate::tls::{TlsHelper, TlsProvider};

/// Listens for ranks and dispatches their frames to registered handlers.
///
/// Register handlers first, then [`Server::start`]. Startup order is TLS,
/// cleanup thread, workers, listener; [`Server::stop`] unwinds in reverse.
#[derive(Debug)]
pub struct Server {
    options: ServerOptions,
    endpoint: Arc<Endpoint>,
    tls: TlsHelper,
    listener: Mutex<Option<Listener>>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let endpoint = Endpoint::new("server", options.transport.clone());
        let tls = TlsHelper::new(options.tls.clone());
        Self {
            options,
            endpoint,
            tls,
            listener: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn register_request_handler<F>(&self, msg_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(RequestContext) + Send + Sync + 'static,
    {
        self.endpoint.register_request_handler(msg_type, handler)
    }

    pub fn register_sent_handler<F>(&self, msg_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(SentNotice) + Send + Sync + 'static,
    {
        self.endpoint.register_sent_handler(msg_type, handler)
    }

    /// Hook run on every connect request after magic and version passed.
    pub fn set_connect_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(&ConnectRequest, &str) -> std::result::Result<(), ConnectResult> + Send + Sync + 'static,
    {
        let hook: Arc<ConnectHook> = Arc::new(hook);
        self.endpoint.with_handlers(|table| table.set_connect_hook(hook))
    }

    pub fn set_link_broken_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let hook: Arc<LinkBrokenHook> = Arc::new(hook);
        self.endpoint.with_handlers(|table| table.set_broken_hook(hook))
    }

    /// Decrypts an encrypted key passphrase from the TLS options.
    pub fn register_decrypt<F>(&self, decrypt: F) -> Result<()>
    where
        F: Fn(&str) -> std::result::Result<Zeroizing<String>, String> + Send + Sync + 'static,
    {
        self.tls.register_decrypt(decrypt)
    }

    pub fn start(&self) -> Result<()> {
        self.options.validate()?;
        let addr = parse_addr("listen_addr", &self.options.listen_addr)?;
        self.endpoint.ensure_startable()?;

        let provider = if self.tls.enabled() {
            Some(self.tls.start()?)
        } else {
            None
        };
        if let Err(err) = self.endpoint.start() {
            self.tls.stop();
            return Err(err);
        }

        let listener = match Listener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(addr = %addr, error = %err, "bind failed");
                self.endpoint.stop();
                self.tls.stop();
                return Err(err);
            }
        };
        let endpoint = Arc::downgrade(&self.endpoint);
        let handler: Arc<AcceptHandler> = Arc::new(move |stream, peer| {
            let Some(endpoint) = endpoint.upgrade() else {
                return;
            };
            if let Err(err) = endpoint.accept(stream, peer, provider.as_ref()) {
                tracing::warn!(%peer, error = %err, "handshake failed");
            }
        });
        if let Err(err) = listener.start(handler, self.options.transport.poll_timeout()) {
            self.endpoint.stop();
            self.tls.stop();
            return Err(err);
        }
        tracing::info!(
            addr = %listener.local_addr(),
            rank = self.options.rank_id,
            tls = self.tls.enabled(),
            "server started"
        );
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
        self.endpoint.stop();
        self.tls.stop();
    }

    /// Tears the server down in a forked child without touching the parent's threads.
    pub fn stop_after_fork(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop_after_fork();
        }
        self.endpoint.stop_after_fork();
        self.tls.stop_after_fork();
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr())
    }

    fn tls_provider(&self) -> Option<Arc<dyn TlsProvider>> {
        self.tls.provider()
    }

    /// Opens an outbound link to another server and registers it under `peer_rank`.
    pub fn connect_peer(&self, addr: &str, peer_rank: u64) -> Result<Arc<Link>> {
        if !self.is_running() {
            return Err(TransportError::InvalidState("server not running".into()));
        }
        let addr = parse_addr("peer address", addr)?;
        let provider = self.tls_provider();
        let server_name = self.options.tls.server_name.clone().unwrap_or_else(|| addr.ip().to_string());
        let target = Dial {
            addr,
            peer_rank,
            local_rank: self.options.rank_id,
            connect_timeout: self.options.connect_timeout(),
            tls: provider.as_ref().map(|p| (p, server_name.as_str())),
        };
        let pending = dial_with_retry(&target, &self.options.transport, &self.options.connect_retry)?;
        self.endpoint.attach_outbound(pending)
    }

    pub fn send(&self, rank: u64, msg_type: MessageType, body: Bytes, context: Option<Bytes>) -> Result<u32> {
        self.endpoint.send(rank, msg_type, body, context)
    }

    pub fn broadcast<F>(&self, ranks: &[u64], msg_type: MessageType, body: Bytes, context: F) -> Vec<(u64, Result<u32>)>
    where
        F: Fn(u64) -> Option<Bytes>,
    {
        self.endpoint.broadcast(ranks, msg_type, body, context)
    }

    pub fn connected_ranks(&self) -> Vec<u64> {
        self.endpoint.connected_ranks()
    }

    pub fn link(&self, rank: u64) -> Option<Arc<Link>> {
        self.endpoint.link(rank)
    }

    /// Forces the link to `rank` down; the broken hook fires as usual.
    pub fn disconnect(&self, rank: u64) -> bool {
        match self.endpoint.link(rank) {
            Some(link) => {
                self.endpoint.fail_link(&link, &TransportError::LinkBroken);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> EndpointStats {
        self.endpoint.stats()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportOptions;

    fn options() -> ServerOptions {
        ServerOptions {
            listen_addr: "127.0.0.1:0".to_string(),
            transport: TransportOptions {
                worker_count: 2,
                poll_timeout_ms: 10,
                ..TransportOptions::default()
            },
            ..ServerOptions::default()
        }
    }

    #[test]
    fn test_start_stop() {
        let server = Server::new(options());
        server.register_request_handler(MessageType::Report, |_| {}).unwrap();
        server.start().unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().unwrap().port() != 0);
        assert!(server.register_request_handler(MessageType::Echo, |_| {}).is_err());
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_bad_listen_addr() {
        let server = Server::new(ServerOptions {
            listen_addr: "not an address".to_string(),
            ..options()
        });
        assert!(matches!(server.start(), Err(TransportError::InvalidConfig { .. })));
        assert!(!server.is_running());
    }

    #[test]
    fn test_connect_peer_requires_running() {
        let server = Server::new(options());
        assert!(matches!(
            server.connect_peer("127.0.0.1:1", 3),
            Err(TransportError::InvalidState(_))
        ));
    }
}
