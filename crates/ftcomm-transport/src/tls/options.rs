use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Default interval between certificate expiry checks.
pub const DEFAULT_CHECK_PERIOD_SECS: u64 = 7 * DAY_SECS;
const CHECK_PERIOD_RANGE: (u64, u64) = (DAY_SECS, 30 * DAY_SECS);

/// Default warning window before certificate expiry.
pub const DEFAULT_WARN_AHEAD_SECS: u64 = 60 * DAY_SECS;
const WARN_AHEAD_RANGE: (u64, u64) = (7 * DAY_SECS, 180 * DAY_SECS);

/// Which TLS implementation backs the links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsProviderKind {
    /// System libssl/libcrypto resolved at runtime.
    #[default]
    Dynamic,
    /// In-process rustls.
    Rustls,
}

/// Private key passphrase, either as-is or encrypted for the decrypt callback.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Passphrase {
    Plain(String),
    Encrypted(String),
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Passphrase::Plain(_) => f.write_str("Passphrase::Plain(<redacted>)"),
            Passphrase::Encrypted(_) => f.write_str("Passphrase::Encrypted(<redacted>)"),
        }
    }
}

/// TLS configuration for a server or client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    pub provider: TlsProviderKind,
    /// Every configured file must resolve under this directory.
    pub base_dir: PathBuf,
    pub ca_paths: Vec<PathBuf>,
    pub crl_paths: Vec<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub passphrase: Option<Passphrase>,
    /// Name checked against the server certificate; defaults to the peer IP.
    pub server_name: Option<String>,
    pub max_file_size: u64,
    pub min_rsa_bits: usize,
    pub min_ec_bits: usize,
    pub check_period_secs: u64,
    pub warn_ahead_secs: u64,
    pub ssl_library_path: String,
    pub crypto_library_path: String,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: TlsProviderKind::Dynamic,
            base_dir: PathBuf::from("/etc/ftcomm/tls"),
            ca_paths: Vec::new(),
            crl_paths: Vec::new(),
            cert_path: None,
            key_path: None,
            passphrase: None,
            server_name: None,
            max_file_size: 10 * 1024 * 1024,
            min_rsa_bits: 2048,
            min_ec_bits: 256,
            check_period_secs: DEFAULT_CHECK_PERIOD_SECS,
            warn_ahead_secs: DEFAULT_WARN_AHEAD_SECS,
            ssl_library_path: "libssl.so.3".to_string(),
            crypto_library_path: "libcrypto.so.3".to_string(),
        }
    }
}

impl TlsOptions {
    /// Checks the options without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(TransportError::invalid_config("tls.cert_path", "required when TLS is enabled"));
        }
        if self.key_path.is_none() {
            return Err(TransportError::invalid_config("tls.key_path", "required when TLS is enabled"));
        }
        if self.ca_paths.is_empty() {
            return Err(TransportError::invalid_config("tls.ca_paths", "at least one CA is required"));
        }
        if !self.base_dir.is_absolute() {
            return Err(TransportError::invalid_config("tls.base_dir", "must be absolute"));
        }
        if self.max_file_size == 0 {
            return Err(TransportError::invalid_config("tls.max_file_size", "must be non-zero"));
        }
        if self.provider == TlsProviderKind::Dynamic && self.ssl_library_path.is_empty() {
            return Err(TransportError::invalid_config("tls.ssl_library_path", "must not be empty"));
        }
        Ok(())
    }

    /// Expiry check period, clamped to [1 day, 30 days].
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(clamp_or_default(
            "check_period_secs",
            self.check_period_secs,
            CHECK_PERIOD_RANGE,
            DEFAULT_CHECK_PERIOD_SECS,
        ))
    }

    /// Expiry warning window, clamped to [7 days, 180 days].
    pub fn warn_ahead(&self) -> Duration {
        Duration::from_secs(clamp_or_default(
            "warn_ahead_secs",
            self.warn_ahead_secs,
            WARN_AHEAD_RANGE,
            DEFAULT_WARN_AHEAD_SECS,
        ))
    }
}

fn clamp_or_default(name: &str, value: u64, (min, max): (u64, u64), default: u64) -> u64 {
    if (min..=max).contains(&value) {
        value
    } else {
        tracing::warn!(option = name, value, min, max, default, "TLS option out of range, using default");
        default
    }
}
