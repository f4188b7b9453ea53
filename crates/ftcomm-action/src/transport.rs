//! The engine's view of the network.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use ftcomm_transport::{MessageType, Server, TransportError};

use crate::action::Rank;
use crate::engine::ActionEngine;
use crate::error::Result;
use crate::opcode::Opcode;

/// Queues one action message for a rank.
///
/// Completion must later be reported to [`ActionEngine::handle_send_complete`]
/// with the same `context`, either as sent or as dropped by a broken link.
pub trait ActionTransport: Send + Sync {
    fn send_action(&self, rank: Rank, msg_type: MessageType, payload: Bytes, context: Bytes) -> std::result::Result<(), TransportError>;
}

impl ActionTransport for Server {
    fn send_action(&self, rank: Rank, msg_type: MessageType, payload: Bytes, context: Bytes) -> std::result::Result<(), TransportError> {
        self.send(u64::from(rank), msg_type, payload, Some(context)).map(|_| ())
    }
}

/// Routes the server's completion and reply callbacks for every opcode into `engine`.
///
/// Must run before the server starts.
pub fn bind_server(server: &Server, engine: &Arc<ActionEngine>) -> Result<()> {
    for opcode in Opcode::ALL {
        let weak: Weak<ActionEngine> = Arc::downgrade(engine);
        server.register_sent_handler(opcode.request_type(), move |notice| {
            if let Some(engine) = weak.upgrade() {
                engine.handle_send_complete(&notice);
            }
        })?;

        let weak: Weak<ActionEngine> = Arc::downgrade(engine);
        server.register_request_handler(opcode.reply_type(), move |ctx| {
            let Some(engine) = weak.upgrade() else {
                return;
            };
            match Rank::try_from(ctx.rank()) {
                Ok(sender) => {
                    engine.handle_reply_from(opcode, sender, ctx.body());
                }
                Err(_) => tracing::warn!(opcode = %opcode, link_rank = ctx.rank(), "reply on a link without a rank id dropped"),
            }
        })?;
    }
    Ok(())
}
