use thiserror::Error;

use crate::tls::TlsError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid option {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("link broken")]
    LinkBroken,

    #[error("link needs reconnect: {reason}")]
    NeedReconnect { reason: String },

    #[error("send queue full ({depth} entries)")]
    QueueFull { depth: usize },

    #[error("no established link to rank {rank}")]
    NotConnected { rank: u64 },

    #[error("body too large: {size} bytes (max {max_size})")]
    BodyTooLarge { size: usize, max_size: usize },

    #[error("buffer allocation of {requested} bytes exceeds limit {limit}")]
    BufferTooLarge { requested: usize, limit: usize },

    #[error("handshake rejected by {peer}: {result:?}")]
    HandshakeRejected {
        peer: String,
        result: crate::protocol::ConnectResult,
    },

    #[error("{slot} handler already registered")]
    HandlerAlreadyRegistered { slot: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("all workers saturated ({capacity} links per worker)")]
    Saturated { capacity: usize },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the caller may redial and retry; only `NeedReconnect` qualifies.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, TransportError::NeedReconnect { .. })
    }

    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        TransportError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
