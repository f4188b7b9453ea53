//! Wire protocol for the ftcomm transport.
//!
//! Every frame is a fixed 16-byte header followed by exactly `body_len` raw
//! bytes. Connections open with a fixed-size handshake: the initiator sends a
//! [`ConnectRequest`], the acceptor answers with a [`ConnectResponse`]. All
//! integers are little-endian.

use bytes::{Buf, BufMut, Bytes};

/// Frame header size in bytes (type:2 + result:2 + body_len:4 + seq_no:4 + crc:4).
pub const HEADER_LEN: usize = 16;

/// Exclusive upper bound for message type values.
pub const MAX_MESSAGE_TYPE: i16 = 128;

/// Hard ceiling on a frame body, guards receive-side allocation.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Default handshake magic.
pub const DEFAULT_MAGIC: i16 = 0x7F3C;

/// Default protocol version.
pub const DEFAULT_VERSION: i16 = 1;

/// Connect request size in bytes (magic:2 + version:2 + rank_id:8).
pub const CONNECT_REQUEST_LEN: usize = 12;

/// Connect response size in bytes.
pub const CONNECT_RESPONSE_LEN: usize = 2;

/// Message kinds carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i16)]
pub enum MessageType {
    /// Liveness probe.
    Heartbeat = 1,
    /// Rank registration with the controller.
    Register = 2,
    /// Status report from a rank.
    Report = 3,
    /// Pause training.
    Pause = 10,
    /// Reply to [`MessageType::Pause`].
    PauseReply = 11,
    /// Resume training.
    Resume = 12,
    /// Reply to [`MessageType::Resume`].
    ResumeReply = 13,
    /// Save a checkpoint.
    Checkpoint = 14,
    /// Reply to [`MessageType::Checkpoint`].
    CheckpointReply = 15,
    /// Rename checkpoint artifacts.
    Rename = 16,
    /// Reply to [`MessageType::Rename`].
    RenameReply = 17,
    /// Repair a faulty rank.
    Repair = 18,
    /// Reply to [`MessageType::Repair`].
    RepairReply = 19,
    /// Roll back to the last good state.
    Rollback = 20,
    /// Reply to [`MessageType::Rollback`].
    RollbackReply = 21,
    /// Exit the process.
    Exit = 22,
    /// Reply to [`MessageType::Exit`].
    ExitReply = 23,
    /// Generic notification.
    Notify = 24,
    /// Reply to [`MessageType::Notify`].
    NotifyReply = 25,
    /// Diagnostic echo.
    Echo = 126,
}

impl MessageType {
    /// Every message type, in wire order.
    pub const ALL: [MessageType; 20] = [
        MessageType::Heartbeat,
        MessageType::Register,
        MessageType::Report,
        MessageType::Pause,
        MessageType::PauseReply,
        MessageType::Resume,
        MessageType::ResumeReply,
        MessageType::Checkpoint,
        MessageType::CheckpointReply,
        MessageType::Rename,
        MessageType::RenameReply,
        MessageType::Repair,
        MessageType::RepairReply,
        MessageType::Rollback,
        MessageType::RollbackReply,
        MessageType::Exit,
        MessageType::ExitReply,
        MessageType::Notify,
        MessageType::NotifyReply,
        MessageType::Echo,
    ];

    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

impl TryFrom<i16> for MessageType {
    type Error = i16;

    fn try_from(raw: i16) -> std::result::Result<Self, Self::Error> {
        if raw <= 0 || raw >= MAX_MESSAGE_TYPE {
            return Err(raw);
        }
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_i16() == raw)
            .ok_or(raw)
    }
}

/// Frame header, see [`HEADER_LEN`] for the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Raw message type; decode with [`MessageHeader::message_type`].
    pub msg_type: i16,
    /// Response code, meaningful on replies only.
    pub result: i16,
    /// Body length in bytes.
    pub body_len: u32,
    /// Per-link sequence number.
    pub seq_no: u32,
    /// Reserved, not enforced.
    pub crc: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, result: i16, body_len: u32) -> Self {
        Self {
            msg_type: msg_type.as_i16(),
            result,
            body_len,
            seq_no: 0,
            crc: 0,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.msg_type).ok()
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut cursor = &mut out[..];
        cursor.put_i16_le(self.msg_type);
        cursor.put_i16_le(self.result);
        cursor.put_u32_le(self.body_len);
        cursor.put_u32_le(self.seq_no);
        cursor.put_u32_le(self.crc);
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let mut cursor = &raw[..];
        Self {
            msg_type: cursor.get_i16_le(),
            result: cursor.get_i16_le(),
            body_len: cursor.get_u32_le(),
            seq_no: cursor.get_u32_le(),
            crc: cursor.get_u32_le(),
        }
    }
}

/// A complete frame as delivered to request handlers.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }
}

/// Initiator half of the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub magic: i16,
    pub version: i16,
    pub rank_id: u64,
}

impl ConnectRequest {
    pub fn encode(&self) -> [u8; CONNECT_REQUEST_LEN] {
        let mut out = [0u8; CONNECT_REQUEST_LEN];
        let mut cursor = &mut out[..];
        cursor.put_i16_le(self.magic);
        cursor.put_i16_le(self.version);
        cursor.put_u64_le(self.rank_id);
        out
    }

    pub fn decode(raw: &[u8; CONNECT_REQUEST_LEN]) -> Self {
        let mut cursor = &raw[..];
        Self {
            magic: cursor.get_i16_le(),
            version: cursor.get_i16_le(),
            rank_id: cursor.get_u64_le(),
        }
    }
}

/// Outcome of a connect handshake, as carried in [`ConnectResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Accepted,
    BadMagic,
    BadVersion,
    Rejected,
    Saturated,
    Unknown(i16),
}

impl ConnectResult {
    pub fn code(self) -> i16 {
        match self {
            ConnectResult::Accepted => 0,
            ConnectResult::BadMagic => 1,
            ConnectResult::BadVersion => 2,
            ConnectResult::Rejected => 3,
            ConnectResult::Saturated => 4,
            ConnectResult::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            0 => ConnectResult::Accepted,
            1 => ConnectResult::BadMagic,
            2 => ConnectResult::BadVersion,
            3 => ConnectResult::Rejected,
            4 => ConnectResult::Saturated,
            other => ConnectResult::Unknown(other),
        }
    }
}

/// Acceptor half of the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: ConnectResult,
}

impl ConnectResponse {
    pub fn encode(&self) -> [u8; CONNECT_RESPONSE_LEN] {
        self.result.code().to_le_bytes()
    }

    pub fn decode(raw: &[u8; CONNECT_RESPONSE_LEN]) -> Self {
        Self {
            result: ConnectResult::from_code(i16::from_le_bytes(*raw)),
        }
    }
}
