//! TLS integration for links.
//!
//! [`TlsHelper`] validates and loads certificate material, checks it
//! (validity window, key strength, revocation) and builds a [`TlsProvider`]:
//! either [`DynamicTls`], which resolves the system libssl/libcrypto function
//! table at runtime, or [`RustlsTls`], an in-process provider. Links only ever
//! see the [`TlsSession`] trait.

mod cert;
mod dynamic;
mod files;
mod helper;
mod options;
mod provider;
mod rustls_backend;

use std::path::PathBuf;

use thiserror::Error;

pub use cert::{expiry_status, CertStatus, CertificateInfo};
pub use dynamic::DynamicTls;
pub use files::validate_file;
pub use helper::{DecryptFn, TlsHelper, TlsMaterial};
pub use options::{Passphrase, TlsOptions, TlsProviderKind};
pub use provider::{TlsProvider, TlsSession};
pub use rustls_backend::RustlsTls;

/// Errors raised while loading TLS material or running a TLS session.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A configured path failed validation.
    #[error("invalid TLS file {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// A configured file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Certificate, key or CRL content is unusable.
    #[error("certificate error: {reason}")]
    Certificate { reason: String },

    /// The certificate is outside its validity window.
    #[error("certificate not valid now (valid {not_before}..{not_after})")]
    OutsideValidity { not_before: i64, not_after: i64 },

    /// The public key is weaker than the configured minimum.
    #[error("{kind} key of {bits} bits is below the minimum of {min_bits}")]
    WeakKey {
        kind: &'static str,
        bits: usize,
        min_bits: usize,
    },

    /// The certificate serial appears in a configured CRL.
    #[error("certificate {serial} is revoked")]
    Revoked { serial: String },

    /// The key passphrase could not be resolved.
    #[error("passphrase error: {reason}")]
    Passphrase { reason: String },

    /// The dynamic crypto library could not be opened.
    #[error("failed to load {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    /// A required symbol is absent from the dynamic crypto library.
    #[error("crypto library lacks required symbol {name}")]
    MissingSymbol { name: String },

    /// Handshake failed.
    #[error("TLS handshake failed: {reason}")]
    Handshake { reason: String },

    /// Provider setup failed.
    #[error("TLS provider error: {reason}")]
    Provider { reason: String },
}
