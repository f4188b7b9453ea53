//! Control actions and their request/reply message types.

use std::fmt;

use ftcomm_transport::MessageType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Opcode {
    Pause = 1,
    Resume = 2,
    Checkpoint = 3,
    Rename = 4,
    Repair = 5,
    Rollback = 6,
    Exit = 7,
    Notify = 8,
}

impl Opcode {
    pub const ALL: [Opcode; 8] = [
        Opcode::Pause,
        Opcode::Resume,
        Opcode::Checkpoint,
        Opcode::Rename,
        Opcode::Repair,
        Opcode::Rollback,
        Opcode::Exit,
        Opcode::Notify,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        Opcode::ALL.iter().copied().find(|op| op.as_u16() == raw)
    }

    /// Upper-case name, as used in environment variable names.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Pause => "PAUSE",
            Opcode::Resume => "RESUME",
            Opcode::Checkpoint => "CHECKPOINT",
            Opcode::Rename => "RENAME",
            Opcode::Repair => "REPAIR",
            Opcode::Rollback => "ROLLBACK",
            Opcode::Exit => "EXIT",
            Opcode::Notify => "NOTIFY",
        }
    }

    /// Message type of the broadcast request.
    pub fn request_type(self) -> MessageType {
        match self {
            Opcode::Pause => MessageType::Pause,
            Opcode::Resume => MessageType::Resume,
            Opcode::Checkpoint => MessageType::Checkpoint,
            Opcode::Rename => MessageType::Rename,
            Opcode::Repair => MessageType::Repair,
            Opcode::Rollback => MessageType::Rollback,
            Opcode::Exit => MessageType::Exit,
            Opcode::Notify => MessageType::Notify,
        }
    }

    /// Message type ranks answer with.
    pub fn reply_type(self) -> MessageType {
        match self {
            Opcode::Pause => MessageType::PauseReply,
            Opcode::Resume => MessageType::ResumeReply,
            Opcode::Checkpoint => MessageType::CheckpointReply,
            Opcode::Rename => MessageType::RenameReply,
            Opcode::Repair => MessageType::RepairReply,
            Opcode::Rollback => MessageType::RollbackReply,
            Opcode::Exit => MessageType::ExitReply,
            Opcode::Notify => MessageType::NotifyReply,
        }
    }

    pub fn from_request_type(msg_type: MessageType) -> Option<Self> {
        Opcode::ALL.iter().copied().find(|op| op.request_type() == msg_type)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
