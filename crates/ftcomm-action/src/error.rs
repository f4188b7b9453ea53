use ftcomm_transport::{MessageType, TransportError};
use thiserror::Error;

use crate::action::Rank;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("another broadcast is in progress")]
    Busy,

    #[error("opcode {0} is not registered with this engine")]
    UnknownOpcode(String),

    #[error("action has no target ranks")]
    NoTargets,

    #[error("opcode {opcode} sends {expected:?}, action carries {found:?}")]
    MessageTypeMismatch {
        opcode: String,
        expected: MessageType,
        found: MessageType,
    },

    #[error("{} rank(s) did not respond: {ranks:?}", ranks.len())]
    Unresponsive { ranks: Vec<Rank> },

    #[error("{} rank(s) replied with failure: {ranks:?}", ranks.len())]
    ReplyFailed { ranks: Vec<Rank> },

    #[error("{slot} already registered")]
    HandlerAlreadyRegistered { slot: String },

    #[error("invalid option {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ActionError {
    /// Ranks the caller should treat as abnormal, if any.
    pub fn ranks(&self) -> &[Rank] {
        match self {
            ActionError::Unresponsive { ranks } | ActionError::ReplyFailed { ranks } => ranks,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, ActionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranks_exposed() {
        let err = ActionError::Unresponsive { ranks: vec![3, 5] };
        assert_eq!(err.ranks(), &[3, 5]);
        assert_eq!(err.to_string(), "2 rank(s) did not respond: [3, 5]");
        assert!(ActionError::Busy.ranks().is_empty());
    }
}
