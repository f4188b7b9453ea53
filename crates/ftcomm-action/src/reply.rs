//! Reply payloads and the callback context carried through the transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::action::Rank;
use crate::opcode::Opcode;

/// `status:i32, serial_number:i64, rank:i32`, little-endian.
pub const REPLY_PAYLOAD_LEN: usize = 16;

/// `opcode:u16, rank:u32, serial_number:i64`, little-endian.
pub const CALLBACK_CONTEXT_LEN: usize = 14;

/// Default application reply; status 0 means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPayload {
    pub status: i32,
    pub serial_number: i64,
    pub rank: i32,
}

impl ReplyPayload {
    pub fn new(status: i32, serial_number: i64, rank: Rank) -> Self {
        Self {
            status,
            serial_number,
            rank: rank as i32,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    pub fn rank(&self) -> Option<Rank> {
        Rank::try_from(self.rank).ok()
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(REPLY_PAYLOAD_LEN);
        out.put_i32_le(self.status);
        out.put_i64_le(self.serial_number);
        out.put_i32_le(self.rank);
        out.freeze()
    }

    /// `None` unless `raw` is exactly [`REPLY_PAYLOAD_LEN`] bytes.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != REPLY_PAYLOAD_LEN {
            return None;
        }
        let mut cursor = raw;
        Some(Self {
            status: cursor.get_i32_le(),
            serial_number: cursor.get_i64_le(),
            rank: cursor.get_i32_le(),
        })
    }
}

/// Parses an opcode-specific reply body.
pub type ReplyParser = dyn Fn(&[u8]) -> Option<ReplyPayload> + Send + Sync;

/// Identifies the broadcast a queued message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackContext {
    pub opcode: Opcode,
    pub rank: Rank,
    pub serial_number: i64,
}

impl CallbackContext {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(CALLBACK_CONTEXT_LEN);
        out.put_u16_le(self.opcode.as_u16());
        out.put_u32_le(self.rank);
        out.put_i64_le(self.serial_number);
        out.freeze()
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != CALLBACK_CONTEXT_LEN {
            return None;
        }
        let mut cursor = raw;
        let opcode = Opcode::from_u16(cursor.get_u16_le())?;
        Some(Self {
            opcode,
            rank: cursor.get_u32_le(),
            serial_number: cursor.get_i64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_layout() {
        let reply = ReplyPayload::new(-3, 0x0102_0304_0506_0708, 42);
        let raw = reply.encode();
        assert_eq!(raw.len(), REPLY_PAYLOAD_LEN);
        assert_eq!(&raw[0..4], &(-3i32).to_le_bytes());
        assert_eq!(&raw[4..12], &0x0102_0304_0506_0708i64.to_le_bytes());
        assert_eq!(&raw[12..16], &42i32.to_le_bytes());
        assert_eq!(ReplyPayload::decode(&raw), Some(reply));
        assert!(!reply.is_success());
    }

    #[test]
    fn test_malformed_lengths_rejected() {
        assert_eq!(ReplyPayload::decode(&[0u8; 15]), None);
        assert_eq!(ReplyPayload::decode(&[0u8; 17]), None);
        assert_eq!(CallbackContext::decode(&[0u8; 13]), None);
        // opcode 0 is not a valid action
        assert_eq!(CallbackContext::decode(&[0u8; CALLBACK_CONTEXT_LEN]), None);
        assert_eq!(ReplyPayload::new(0, 1, 0).rank(), Some(0));
        let negative = ReplyPayload {
            status: 0,
            serial_number: 1,
            rank: -1,
        };
        assert_eq!(negative.rank(), None);
    }

    #[test]
    fn test_context_layout() {
        let ctx = CallbackContext {
            opcode: Opcode::Checkpoint,
            rank: 7,
            serial_number: -9,
        };
        let raw = ctx.encode();
        assert_eq!(raw.len(), CALLBACK_CONTEXT_LEN);
        assert_eq!(&raw[0..2], &3u16.to_le_bytes());
        assert_eq!(CallbackContext::decode(&raw), Some(ctx));
    }
}
