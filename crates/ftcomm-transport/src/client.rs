//! Rank-side endpoint: one link to the controller.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::config::{parse_addr, ClientOptions};
use crate::connector::{dial_with_retry, Dial};
use crate::endpoint::{Endpoint, EndpointStats};
use crate::error::{Result, TransportError};
use crate::handler::{LinkBrokenHook, RequestContext, SentNotice};
use crate::link::Link;
use crate::protocol::MessageType;
use crate::tls::TlsHelper;

/// Key under which the controller link is stored.
pub const SERVER_RANK: u64 = u64::MAX;

/// Connects to the controller and exchanges frames with it.
#[derive(Debug)]
pub struct Client {
    options: ClientOptions,
    endpoint: Arc<Endpoint>,
    tls: TlsHelper,
    // Serialises connect and reconnect.
    connecting: Mutex<()>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let endpoint = Endpoint::new("client", options.transport.clone());
        let tls = TlsHelper::new(options.tls.clone());
        Self {
            options,
            endpoint,
            tls,
            connecting: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn rank_id(&self) -> u64 {
        self.options.rank_id
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

    pub fn set_link_broken_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let hook: Arc<LinkBrokenHook> = Arc::new(hook);
        self.endpoint.with_handlers(|table| table.set_broken_hook(hook))
    }

    pub fn register_decrypt<F>(&self, decrypt: F) -> Result<()>
    where
        F: Fn(&str) -> std::result::Result<Zeroizing<String>, String> + Send + Sync + 'static,
    {
        self.tls.register_decrypt(decrypt)
    }

    /// Starts TLS and the worker, then connects to the controller.
    pub fn start(&self) -> Result<()> {
        self.options.validate()?;
        parse_addr("server_addr", &self.options.server_addr)?;
        self.endpoint.ensure_startable()?;
        if self.tls.enabled() {
            self.tls.start()?;
        }
        if let Err(err) = self.endpoint.start() {
            self.tls.stop();
            return Err(err);
        }
        if let Err(err) = self.connect() {
            self.stop();
            return Err(err);
        }
        Ok(())
    }

    fn connect(&self) -> Result<Arc<Link>> {
        let addr = parse_addr("server_addr", &self.options.server_addr)?;
        let provider = self.tls.provider();
        let server_name = self
            .options
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| addr.ip().to_string());
        let target = Dial {
            addr,
            peer_rank: SERVER_RANK,
            local_rank: self.options.rank_id,
            connect_timeout: self.options.connect_timeout(),
            tls: provider.as_ref().map(|p| (p, server_name.as_str())),
        };
        let pending = dial_with_retry(&target, &self.options.transport, &self.options.connect_retry)?;
        let link = self.endpoint.attach_outbound(pending)?;
        tracing::info!(addr = %addr, rank = self.options.rank_id, link_id = link.id(), tls = link.is_tls(), "connected to server");
        Ok(link)
    }

    /// Dials again if the controller link is gone; a live link is left alone.
    pub fn reconnect(&self) -> Result<()> {
        if !self.endpoint.is_running() {
            return Err(TransportError::InvalidState("client not running".into()));
        }
        let _guard = self.connecting.lock();
        if self.is_connected() {
            return Ok(());
        }
        tracing::info!(rank = self.options.rank_id, "reconnecting");
        self.connect().map(|_| ())
    }

    pub fn stop(&self) {
        self.endpoint.stop();
        self.tls.stop();
    }

    pub fn stop_after_fork(&self) {
        self.endpoint.stop_after_fork();
        self.tls.stop_after_fork();
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.link(SERVER_RANK).is_some_and(|l| !l.is_broken())
    }

    pub fn link(&self) -> Option<Arc<Link>> {
        self.endpoint.link(SERVER_RANK)
    }

    pub fn send(&self, msg_type: MessageType, body: Bytes) -> Result<u32> {
        self.endpoint.send(SERVER_RANK, msg_type, body, None)
    }

    /// Sends with a callback context returned through the sent handler.
    pub fn send_with_context(&self, msg_type: MessageType, body: Bytes, context: Bytes) -> Result<u32> {
        self.endpoint.send(SERVER_RANK, msg_type, body, Some(context))
    }

    pub fn stats(&self) -> EndpointStats {
        self.endpoint.stats()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
