//! Application handler tables keyed by message type.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::link::{Link, LinkId};
use crate::protocol::{ConnectRequest, ConnectResult, Frame, MessageType};

/// An inbound frame together with the link it arrived on.
#[derive(Debug, Clone)]
pub struct RequestContext {
    link: Arc<Link>,
    frame: Frame,
}

impl RequestContext {
    pub fn new(link: Arc<Link>, frame: Frame) -> Self {
        Self { link, frame }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Rank announced by the sender at connect time.
    pub fn rank(&self) -> u64 {
        self.link.rank()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn body(&self) -> &Bytes {
        &self.frame.body
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.frame.message_type()
    }

    /// Answers on the same link.
    pub fn reply(&self, msg_type: MessageType, result: i16, body: Bytes) -> Result<u32> {
        self.link.enqueue(msg_type, result, body, None)
    }
}

/// How a queued message left the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every byte reached the socket.
    Sent,
    /// The link broke before the message was fully written.
    Broken,
}

/// Completion report for a message that carried a callback context.
#[derive(Debug, Clone)]
pub struct SentNotice {
    pub rank: u64,
    pub link_id: LinkId,
    pub msg_type: MessageType,
    pub seq_no: u32,
    pub status: SendStatus,
    pub context: Option<Bytes>,
}

pub type RequestHandler = dyn Fn(RequestContext) + Send + Sync;
pub type SentHandler = dyn Fn(SentNotice) + Send + Sync;
/// Inspects a connect request; `Err` rejects the connection with that code.
pub type ConnectHook = dyn Fn(&ConnectRequest, &str) -> std::result::Result<(), ConnectResult> + Send + Sync;
pub type LinkBrokenHook = dyn Fn(u64, LinkId) + Send + Sync;

/// Handlers registered on an endpoint.
///
/// Built before start and read-only afterwards.
#[derive(Default)]
pub struct HandlerTable {
    requests: HashMap<MessageType, Arc<RequestHandler>>,
    sent: HashMap<MessageType, Arc<SentHandler>>,
    connect: Option<Arc<ConnectHook>>,
    broken: Option<Arc<LinkBrokenHook>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("sent", &self.sent.keys().collect::<Vec<_>>())
            .field("connect", &self.connect.is_some())
            .field("broken", &self.broken.is_some())
            .finish()
    }
}

fn duplicate(slot: String) -> TransportError {
    TransportError::HandlerAlreadyRegistered { slot }
}

impl HandlerTable {
    pub fn register_request(&mut self, msg_type: MessageType, handler: Arc<RequestHandler>) -> Result<()> {
        if self.requests.contains_key(&msg_type) {
            return Err(duplicate(format!("request {msg_type:?}")));
        }
        self.requests.insert(msg_type, handler);
        Ok(())
    }

    pub fn register_sent(&mut self, msg_type: MessageType, handler: Arc<SentHandler>) -> Result<()> {
        if self.sent.contains_key(&msg_type) {
            return Err(duplicate(format!("sent {msg_type:?}")));
        }
        self.sent.insert(msg_type, handler);
        Ok(())
    }

    pub fn set_connect_hook(&mut self, hook: Arc<ConnectHook>) -> Result<()> {
        if self.connect.is_some() {
            return Err(duplicate("connect hook".to_string()));
        }
        self.connect = Some(hook);
        Ok(())
    }

    pub fn set_broken_hook(&mut self, hook: Arc<LinkBrokenHook>) -> Result<()> {
        if self.broken.is_some() {
            return Err(duplicate("link broken hook".to_string()));
        }
        self.broken = Some(hook);
        Ok(())
    }

    pub fn request(&self, msg_type: MessageType) -> Option<&Arc<RequestHandler>> {
        self.requests.get(&msg_type)
    }

    pub fn sent(&self, msg_type: MessageType) -> Option<&Arc<SentHandler>> {
        self.sent.get(&msg_type)
    }

    pub fn connect_hook(&self) -> Option<&Arc<ConnectHook>> {
        self.connect.as_ref()
    }

    pub fn broken_hook(&self) -> Option<&Arc<LinkBrokenHook>> {
        self.broken.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = HandlerTable::default();
        table
            .register_request(MessageType::Pause, Arc::new(|_ctx: RequestContext| {}))
            .unwrap();
        let err = table
            .register_request(MessageType::Pause, Arc::new(|_ctx: RequestContext| {}))
            .unwrap_err();
        assert!(matches!(err, TransportError::HandlerAlreadyRegistered { .. }));
        assert!(table
            .register_request(MessageType::Resume, Arc::new(|_ctx: RequestContext| {}))
            .is_ok());

        table.register_sent(MessageType::Pause, Arc::new(|_n: SentNotice| {})).unwrap();
        assert!(table.register_sent(MessageType::Pause, Arc::new(|_n: SentNotice| {})).is_err());

        table.set_broken_hook(Arc::new(|_rank, _id| {})).unwrap();
        assert!(table.set_broken_hook(Arc::new(|_rank, _id| {})).is_err());
    }

    #[test]
    fn test_lookup_by_type() {
        let mut table = HandlerTable::default();
        table
            .set_connect_hook(Arc::new(|req: &ConnectRequest, _peer: &str| {
                if req.rank_id == 0 {
                    Err(ConnectResult::Rejected)
                } else {
                    Ok(())
                }
            }))
            .unwrap();
        assert!(table.request(MessageType::Exit).is_none());
        let hook = table.connect_hook().unwrap();
        let req = ConnectRequest {
            magic: 1,
            version: 1,
            rank_id: 0,
        };
        assert_eq!(hook(&req, "127.0.0.1:1"), Err(ConnectResult::Rejected));
    }
}
