use bytes::Bytes;
use ftcomm_transport::MessageType;

/// Participant id within one training job.
pub type Rank = u32;

/// One broadcastable unit: a message for a group of ranks.
#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub message_type: MessageType,
    pub payload: Bytes,
    pub ranks: Vec<Rank>,
}

impl ActionInfo {
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>, ranks: Vec<Rank>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
            ranks,
        }
    }
}

/// Sorted, de-duplicated union of every action's ranks.
pub fn target_ranks(actions: &[ActionInfo]) -> Vec<Rank> {
    let mut ranks: Vec<Rank> = actions.iter().flat_map(|a| a.ranks.iter().copied()).collect();
    ranks.sort_unstable();
    ranks.dedup();
    ranks
}
