//! Engine options and per-opcode reply timeouts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ActionError, Result};
use crate::opcode::Opcode;

pub const MIN_REPLY_TIMEOUT_SECS: u64 = 1;
pub const MAX_REPLY_TIMEOUT_SECS: u64 = 3600;

/// Reply wait per opcode, in seconds.
///
/// `FTCOMM_<OPCODE>_REPLY_TIMEOUT` overrides the configured value. Both are
/// clamped to `[MIN_REPLY_TIMEOUT_SECS, MAX_REPLY_TIMEOUT_SECS]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyTimeouts {
    pub pause: u64,
    pub resume: u64,
    pub checkpoint: u64,
    pub rename: u64,
    pub repair: u64,
    pub rollback: u64,
    pub exit: u64,
    pub notify: u64,
}

impl Default for ReplyTimeouts {
    fn default() -> Self {
        Self {
            pause: 30,
            resume: 30,
            checkpoint: 600,
            rename: 60,
            repair: 180,
            rollback: 180,
            exit: 30,
            notify: 30,
        }
    }
}

impl ReplyTimeouts {
    pub fn configured_secs(&self, opcode: Opcode) -> u64 {
        match opcode {
            Opcode::Pause => self.pause,
            Opcode::Resume => self.resume,
            Opcode::Checkpoint => self.checkpoint,
            Opcode::Rename => self.rename,
            Opcode::Repair => self.repair,
            Opcode::Rollback => self.rollback,
            Opcode::Exit => self.exit,
            Opcode::Notify => self.notify,
        }
    }

    /// Effective timeout, honouring the environment override.
    pub fn get(&self, opcode: Opcode) -> Duration {
        let raw = std::env::var(env_var_name(opcode)).ok();
        self.resolve(opcode, raw.as_deref())
    }

    /// Effective timeout for an explicit override value.
    pub fn resolve(&self, opcode: Opcode, raw: Option<&str>) -> Duration {
        let configured = self.configured_secs(opcode);
        let secs = match raw.map(str::trim) {
            None | Some("") => configured,
            Some(value) => match value.parse::<u64>() {
                Ok(secs) => secs,
                Err(_) => {
                    tracing::warn!(
                        opcode = %opcode,
                        value,
                        default_secs = configured,
                        "ignoring unparsable reply timeout"
                    );
                    configured
                }
            },
        };
        let clamped = secs.clamp(MIN_REPLY_TIMEOUT_SECS, MAX_REPLY_TIMEOUT_SECS);
        if clamped != secs {
            tracing::warn!(opcode = %opcode, requested = secs, clamped, "reply timeout out of range");
        }
        Duration::from_secs(clamped)
    }
}

pub fn env_var_name(opcode: Opcode) -> String {
    format!("FTCOMM_{}_REPLY_TIMEOUT", opcode.name())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wait for transport completions per delivery round (default: 3000).
    pub send_timeout_ms: u64,
    /// Extra delivery rounds for ranks without a completion (default: 2).
    pub send_retry_times: u32,
    pub reply_timeouts: ReplyTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 3_000,
            send_retry_times: 2,
            reply_timeouts: ReplyTimeouts::default(),
        }
    }
}

impl EngineConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_timeout_ms == 0 {
            return Err(ActionError::InvalidConfig {
                field: "send_timeout_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = ftcomm_transport::config::load_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
