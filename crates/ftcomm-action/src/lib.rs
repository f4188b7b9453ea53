//! ftcomm action engine.
//!
//! The controller uses an [`ActionEngine`] to push a control action (pause,
//! checkpoint, exit, ...) to a set of ranks and learn which of them took it.
//! Delivery is tracked through the transport's send completions, replies
//! through the opcode's reply message, both keyed by the broadcast's serial
//! number so late callbacks from an earlier broadcast are ignored.

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod opcode;
pub mod reply;
pub mod status;
pub mod transport;

pub use action::{target_ranks, ActionInfo, Rank};
pub use config::{EngineConfig, ReplyTimeouts};
pub use engine::{ActionEngine, ActionReport, RankHealth};
pub use error::{ActionError, Result};
pub use opcode::Opcode;
pub use reply::{CallbackContext, ReplyPayload};
pub use status::{AtomicStatusVector, RecordOutcome, Status};
pub use transport::{bind_server, ActionTransport};
