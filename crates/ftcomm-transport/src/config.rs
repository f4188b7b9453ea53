//! Option structs for servers and clients.
//!
//! Everything is plain serde data with defaults; `validate()` is called by
//! `start()` before any thread or socket is created.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::protocol::{DEFAULT_MAGIC, DEFAULT_VERSION, MAX_BODY_LEN};
use crate::retry::RetryConfig;
use crate::tls::TlsOptions;

/// TCP keepalive tuning applied to every established link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeepaliveOptions {
    pub enabled: bool,
    /// Idle seconds before the first probe, 1..=7200.
    pub idle_secs: u32,
    /// Seconds between probes, 1..=75.
    pub interval_secs: u32,
    /// Unanswered probes before the kernel drops the connection, 1..=9.
    pub probes: u32,
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: 60,
            interval_secs: 10,
            probes: 5,
        }
    }
}

impl KeepaliveOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        check_range("keepalive.idle_secs", self.idle_secs as u64, 1, 7200)?;
        check_range("keepalive.interval_secs", self.interval_secs as u64, 1, 75)?;
        check_range("keepalive.probes", self.probes as u64, 1, 9)
    }
}

/// Worker pool and link tuning shared by servers and clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportOptions {
    pub worker_count: usize,
    /// CPUs to pin workers to, assigned round-robin; empty disables pinning.
    pub cpu_ids: Vec<usize>,
    pub send_queue_depth: usize,
    pub max_links_per_worker: usize,
    pub keepalive: KeepaliveOptions,
    pub poll_timeout_ms: u64,
    /// Grace period before a broken link is finally released.
    pub cleanup_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_body_len: usize,
    pub magic: i16,
    pub version: i16,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            cpu_ids: Vec::new(),
            send_queue_depth: 1024,
            max_links_per_worker: 1024,
            keepalive: KeepaliveOptions::default(),
            poll_timeout_ms: 100,
            cleanup_delay_ms: 1_000,
            handshake_timeout_ms: 5_000,
            max_body_len: MAX_BODY_LEN,
            magic: DEFAULT_MAGIC,
            version: DEFAULT_VERSION,
        }
    }
}

impl TransportOptions {
    pub fn validate(&self) -> Result<()> {
        check_range("worker_count", self.worker_count as u64, 1, 256)?;
        check_range("send_queue_depth", self.send_queue_depth as u64, 1, 65_536)?;
        check_range("max_links_per_worker", self.max_links_per_worker as u64, 1, 65_536)?;
        check_range("poll_timeout_ms", self.poll_timeout_ms, 1, 10_000)?;
        check_range("handshake_timeout_ms", self.handshake_timeout_ms, 1, 600_000)?;
        check_range("cleanup_delay_ms", self.cleanup_delay_ms, 0, 600_000)?;
        check_range("max_body_len", self.max_body_len as u64, 1, MAX_BODY_LEN as u64)?;
        let max_cpu = libc::CPU_SETSIZE as usize;
        if let Some(cpu) = self.cpu_ids.iter().find(|cpu| **cpu >= max_cpu) {
            return Err(TransportError::invalid_config(
                "cpu_ids",
                format!("cpu {cpu} exceeds CPU_SETSIZE {max_cpu}"),
            ));
        }
        self.keepalive.validate()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// CPU for worker `index`, if pinning is configured.
    pub fn cpu_for_worker(&self, index: usize) -> Option<usize> {
        if self.cpu_ids.is_empty() {
            None
        } else {
            Some(self.cpu_ids[index % self.cpu_ids.len()])
        }
    }
}

/// Options of a listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Rank announced when this server dials peers.
    pub rank_id: u64,
    pub transport: TransportOptions,
    pub tls: TlsOptions,
    pub connect_retry: RetryConfig,
    pub connect_timeout_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9600".to_string(),
            rank_id: 0,
            transport: TransportOptions::default(),
            tls: TlsOptions::default(),
            connect_retry: RetryConfig::default(),
            connect_timeout_ms: 3_000,
        }
    }
}

impl ServerOptions {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        parse_addr("listen_addr", &self.listen_addr)?;
        check_range("connect_timeout_ms", self.connect_timeout_ms, 1, 600_000)?;
        self.transport.validate()?;
        self.connect_retry.validate()?;
        self.tls.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        load_file(path)
    }
}

/// Options of a dialing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub server_addr: String,
    pub rank_id: u64,
    pub transport: TransportOptions,
    pub tls: TlsOptions,
    pub connect_retry: RetryConfig,
    pub connect_timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9600".to_string(),
            rank_id: 0,
            transport: TransportOptions {
                worker_count: 1,
                ..TransportOptions::default()
            },
            tls: TlsOptions::default(),
            connect_retry: RetryConfig::default(),
            connect_timeout_ms: 3_000,
        }
    }
}

impl ClientOptions {
    pub fn new(server_addr: impl Into<String>, rank_id: u64) -> Self {
        Self {
            server_addr: server_addr.into(),
            rank_id,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        parse_addr("server_addr", &self.server_addr)?;
        check_range("connect_timeout_ms", self.connect_timeout_ms, 1, 600_000)?;
        self.transport.validate()?;
        self.connect_retry.validate()?;
        self.tls.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        load_file(path)
    }
}

pub(crate) fn parse_addr(field: &'static str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| TransportError::invalid_config(field, format!("{addr:?}: {e}")))
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(TransportError::invalid_config(
            field,
            format!("{value} outside {min}..={max}"),
        ));
    }
    Ok(())
}

/// Reads `.json` or `.toml` option files.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => toml::from_str(&contents)
            .map_err(|e| TransportError::invalid_config("file", e.to_string())),
        "json" => serde_json::from_str(&contents)
            .map_err(|e| TransportError::invalid_config("file", e.to_string())),
        _ => Err(TransportError::invalid_config(
            "file",
            format!("unsupported config file extension: {ext}"),
        )),
    }
}
