//! Loading, checking and monitoring of TLS material.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use zeroize::Zeroizing;

use super::cert::{self, CertStatus};
use super::dynamic::DynamicTls;
use super::files::read_validated;
use super::options::{Passphrase, TlsOptions, TlsProviderKind};
use super::provider::TlsProvider;
use super::rustls_backend::RustlsTls;
use super::TlsError;
use crate::error::{Result, TransportError};

/// Turns an encrypted passphrase into plaintext.
pub type DecryptFn = dyn Fn(&str) -> std::result::Result<Zeroizing<String>, String> + Send + Sync;

/// Parsed certificate material plus the files it came from.
pub struct TlsMaterial {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_paths: Vec<PathBuf>,
    pub crl_paths: Vec<PathBuf>,
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// `None` when the key file is encrypted.
    pub key: Option<PrivateKeyDer<'static>>,
    pub ca_certs: Vec<CertificateDer<'static>>,
    pub crls: Vec<CertificateRevocationListDer<'static>>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("chain_len", &self.cert_chain.len())
            .field("ca_count", &self.ca_certs.len())
            .field("crl_count", &self.crls.len())
            .finish()
    }
}

impl TlsMaterial {
    /// Builds material from in-memory PEM without file paths.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8], crl_pem: Option<&[u8]>) -> std::result::Result<Self, TlsError> {
        Ok(Self {
            cert_path: None,
            key_path: None,
            ca_paths: Vec::new(),
            crl_paths: Vec::new(),
            cert_chain: cert::pem_certificates(cert_pem)?,
            key: parse_key(key_pem)?,
            ca_certs: cert::pem_certificates(ca_pem)?,
            crls: match crl_pem {
                Some(pem) => cert::pem_crls(pem)?,
                None => Vec::new(),
            },
            passphrase: None,
        })
    }

    /// The end-entity certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }
}

fn is_encrypted_key(pem: &[u8]) -> bool {
    let text = String::from_utf8_lossy(pem);
    text.contains("ENCRYPTED PRIVATE KEY") || text.contains("Proc-Type: 4,ENCRYPTED")
}

fn parse_key(pem: &[u8]) -> std::result::Result<Option<PrivateKeyDer<'static>>, TlsError> {
    if is_encrypted_key(pem) {
        return Ok(None);
    }
    cert::pem_private_key(pem).map(Some)
}

struct ExpiryTask {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// Owns the TLS configuration of one server or client.
///
/// `start` validates and loads the configured files, checks the local
/// certificate, builds the provider and starts the periodic expiry check.
pub struct TlsHelper {
    options: TlsOptions,
    decrypt: OnceLock<Arc<DecryptFn>>,
    provider: Mutex<Option<Arc<dyn TlsProvider>>>,
    not_after: Arc<AtomicI64>,
    expiry: Mutex<Option<ExpiryTask>>,
}

impl std::fmt::Debug for TlsHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHelper")
            .field("enabled", &self.enabled())
            .field("provider", &self.provider().map(|p| p.name()))
            .finish()
    }
}

impl TlsHelper {
    pub fn new(options: TlsOptions) -> Self {
        Self {
            options,
            decrypt: OnceLock::new(),
            provider: Mutex::new(None),
            not_after: Arc::new(AtomicI64::new(i64::MAX)),
            expiry: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &TlsOptions {
        &self.options
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// Installs the passphrase decrypt callback; only the first call succeeds.
    pub fn register_decrypt<F>(&self, decrypt: F) -> Result<()>
    where
        F: Fn(&str) -> std::result::Result<Zeroizing<String>, String> + Send + Sync + 'static,
    {
        self.decrypt
            .set(Arc::new(decrypt))
            .map_err(|_| TransportError::HandlerAlreadyRegistered {
                slot: "passphrase decrypt".to_string(),
            })
    }

    /// The active provider, once started.
    pub fn provider(&self) -> Option<Arc<dyn TlsProvider>> {
        self.provider.lock().clone()
    }

    /// Loads material, builds the provider and starts expiry monitoring.
    pub fn start(&self) -> Result<Arc<dyn TlsProvider>> {
        if self.provider.lock().is_some() {
            return Err(TransportError::InvalidState("TLS provider already started".into()));
        }
        self.options.validate()?;
        let material = self.load_material()?;

        let provider: Arc<dyn TlsProvider> = match self.options.provider {
            TlsProviderKind::Dynamic => Arc::new(DynamicTls::new(&self.options, &material)?),
            TlsProviderKind::Rustls => Arc::new(RustlsTls::new(&material)?),
        };
        tracing::info!(provider = provider.name(), "TLS provider ready");

        *self.provider.lock() = Some(provider.clone());
        self.spawn_expiry_check()?;
        Ok(provider)
    }

    /// Stops the expiry check and drops the provider.
    pub fn stop(&self) {
        if let Some(task) = self.expiry.lock().take() {
            let (flag, cvar) = &*task.signal;
            *flag.lock() = true;
            cvar.notify_all();
            if task.handle.join().is_err() {
                tracing::warn!("certificate check thread panicked");
            }
        }
        self.provider.lock().take();
    }

    /// Like [`TlsHelper::stop`], but leaves the parent's check thread alone.
    pub fn stop_after_fork(&self) {
        drop(self.expiry.lock().take());
        self.provider.lock().take();
    }

    /// Reads, parses and checks every configured file.
    pub fn load_material(&self) -> std::result::Result<TlsMaterial, TlsError> {
        let opts = &self.options;
        let read = |path: &Path| read_validated(path, &opts.base_dir, opts.max_file_size);

        let cert_path = opts.cert_path.as_deref().ok_or_else(|| TlsError::Certificate {
            reason: "no certificate configured".to_string(),
        })?;
        let key_path = opts.key_path.as_deref().ok_or_else(|| TlsError::Certificate {
            reason: "no private key configured".to_string(),
        })?;

        let (cert_path, cert_pem) = read(cert_path)?;
        let (key_path, key_pem) = read(key_path)?;
        let key_pem = Zeroizing::new(key_pem);
        let cert_chain = cert::pem_certificates(&cert_pem)?;
        let key = parse_key(&key_pem)?;

        let mut ca_paths = Vec::with_capacity(opts.ca_paths.len());
        let mut ca_certs = Vec::new();
        for path in &opts.ca_paths {
            let (canonical, pem) = read(path)?;
            ca_certs.extend(cert::pem_certificates(&pem)?);
            ca_paths.push(canonical);
        }

        let mut crl_paths = Vec::with_capacity(opts.crl_paths.len());
        let mut crls = Vec::new();
        for path in &opts.crl_paths {
            let (canonical, pem) = read(path)?;
            crls.extend(cert::pem_crls(&pem)?);
            crl_paths.push(canonical);
        }

        let passphrase = self.resolve_passphrase()?;
        if key.is_none() && passphrase.is_none() {
            return Err(TlsError::Passphrase {
                reason: "private key is encrypted but no passphrase is configured".to_string(),
            });
        }

        let material = TlsMaterial {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            ca_paths,
            crl_paths,
            cert_chain,
            key,
            ca_certs,
            crls,
            passphrase,
        };
        self.check_local_certificate(&material)?;
        Ok(material)
    }

    fn resolve_passphrase(&self) -> std::result::Result<Option<Zeroizing<String>>, TlsError> {
        match &self.options.passphrase {
            None => Ok(None),
            Some(Passphrase::Plain(plain)) => Ok(Some(Zeroizing::new(plain.clone()))),
            Some(Passphrase::Encrypted(cipher)) => {
                let decrypt = self.decrypt.get().ok_or_else(|| TlsError::Passphrase {
                    reason: "encrypted passphrase configured without a decrypt callback".to_string(),
                })?;
                decrypt(cipher)
                    .map(Some)
                    .map_err(|reason| TlsError::Passphrase { reason })
            }
        }
    }

    fn check_local_certificate(&self, material: &TlsMaterial) -> std::result::Result<(), TlsError> {
        let leaf = material.leaf().ok_or_else(|| TlsError::Certificate {
            reason: "empty certificate chain".to_string(),
        })?;
        let info = cert::inspect_certificate(leaf)?;
        cert::check_validity(&info, unix_now())?;
        cert::check_key_strength(&info, self.options.min_rsa_bits, self.options.min_ec_bits)?;
        cert::check_not_revoked(leaf, &material.crls)?;

        self.not_after.store(info.not_after, Ordering::Release);
        tracing::info!(
            subject = %info.subject,
            serial = %info.serial,
            fingerprint = %info.fingerprint,
            key_kind = info.key_kind,
            key_bits = info.key_bits,
            not_after = info.not_after,
            "loaded local certificate"
        );
        Ok(())
    }

    /// Classifies and logs the local certificate expiry.
    pub fn check_expiry(&self) -> CertStatus {
        report_expiry(
            self.not_after.load(Ordering::Acquire),
            self.options.warn_ahead(),
        )
    }

    fn spawn_expiry_check(&self) -> Result<()> {
        let mut slot = self.expiry.lock();
        if slot.is_some() {
            return Ok(());
        }
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = signal.clone();
        let not_after = self.not_after.clone();
        let period = self.options.check_period();
        let warn_ahead = self.options.warn_ahead();

        let handle = thread::Builder::new()
            .name("ftcomm-cert-check".to_string())
            .spawn(move || {
                let (flag, cvar) = &*thread_signal;
                let mut stopped = flag.lock();
                while !*stopped {
                    report_expiry(not_after.load(Ordering::Acquire), warn_ahead);
                    cvar.wait_for(&mut stopped, period);
                }
            })?;
        *slot = Some(ExpiryTask { signal, handle });
        Ok(())
    }
}

impl Drop for TlsHelper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn report_expiry(not_after: i64, warn_ahead: Duration) -> CertStatus {
    let status = cert::expiry_status(not_after, unix_now(), warn_ahead.as_secs() as i64);
    match status {
        CertStatus::Expired => tracing::error!(not_after, "local certificate has expired"),
        CertStatus::ExpiringSoon { days_left } => {
            tracing::warn!(days_left, not_after, "local certificate expires soon")
        }
        CertStatus::Valid { days_left } => tracing::debug!(days_left, "local certificate valid"),
    }
    status
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
