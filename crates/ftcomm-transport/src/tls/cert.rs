//! Certificate, key and CRL inspection.

use std::io::Cursor;

use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use x509_parser::public_key::PublicKey;

use super::TlsError;

/// Facts about a certificate that the helper checks and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub serial: String,
    pub not_before: i64,
    pub not_after: i64,
    pub key_kind: &'static str,
    pub key_bits: usize,
    /// Hex SHA-256 of the DER encoding.
    pub fingerprint: String,
}

/// Expiry classification of a certificate at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Valid { days_left: i64 },
    ExpiringSoon { days_left: i64 },
    Expired,
}

fn cert_err(reason: impl Into<String>) -> TlsError {
    TlsError::Certificate {
        reason: reason.into(),
    }
}

/// Parses `der` and extracts the fields used by the checks.
pub fn inspect_certificate(der: &[u8]) -> Result<CertificateInfo, TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| cert_err(format!("failed to parse certificate: {e}")))?;

    let (key_kind, key_bits) = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => ("RSA", rsa.key_size()),
        Ok(PublicKey::EC(point)) => ("EC", point.key_size()),
        Ok(_) => ("other", 0),
        Err(e) => return Err(cert_err(format!("failed to parse public key: {e}"))),
    };

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        key_kind,
        key_bits,
        fingerprint: hex::encode(Sha256::digest(der)),
    })
}

/// Fails unless `now` (unix seconds) lies inside the validity window.
pub fn check_validity(info: &CertificateInfo, now: i64) -> Result<(), TlsError> {
    if now < info.not_before || now > info.not_after {
        return Err(TlsError::OutsideValidity {
            not_before: info.not_before,
            not_after: info.not_after,
        });
    }
    Ok(())
}

/// Enforces the minimum RSA modulus and EC field sizes.
pub fn check_key_strength(info: &CertificateInfo, min_rsa_bits: usize, min_ec_bits: usize) -> Result<(), TlsError> {
    let min_bits = match info.key_kind {
        "RSA" => min_rsa_bits,
        "EC" => min_ec_bits,
        _ => return Err(cert_err("unsupported public key algorithm")),
    };
    if info.key_bits < min_bits {
        return Err(TlsError::WeakKey {
            kind: info.key_kind,
            bits: info.key_bits,
            min_bits,
        });
    }
    Ok(())
}

/// Fails if any CRL issued by the certificate's issuer lists its serial.
pub fn check_not_revoked(cert_der: &[u8], crls: &[CertificateRevocationListDer<'_>]) -> Result<(), TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| cert_err(format!("failed to parse certificate: {e}")))?;

    for crl_der in crls {
        let (_, crl) = x509_parser::parse_x509_crl(crl_der.as_ref())
            .map_err(|e| cert_err(format!("failed to parse CRL: {e}")))?;
        if crl.issuer().as_raw() != cert.issuer().as_raw() {
            continue;
        }
        if crl
            .iter_revoked_certificates()
            .any(|revoked| revoked.raw_serial() == cert.raw_serial())
        {
            return Err(TlsError::Revoked {
                serial: cert.raw_serial_as_string(),
            });
        }
    }
    Ok(())
}

/// Classifies expiry relative to `now` with a warning window of `warn_ahead_secs`.
pub fn expiry_status(not_after: i64, now: i64, warn_ahead_secs: i64) -> CertStatus {
    let remaining = not_after - now;
    if remaining <= 0 {
        return CertStatus::Expired;
    }
    let days_left = remaining / 86_400;
    if remaining <= warn_ahead_secs {
        CertStatus::ExpiringSoon { days_left }
    } else {
        CertStatus::Valid { days_left }
    }
}

/// Reads every certificate from PEM data.
pub(crate) fn pem_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut cursor = Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| cert_err(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(cert_err("no certificates found in PEM"));
    }
    Ok(certs)
}

/// Reads every CRL from PEM data.
pub(crate) fn pem_crls(pem: &[u8]) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    let mut cursor = Cursor::new(pem);
    let crls = rustls_pemfile::crls(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| cert_err(format!("invalid CRL PEM: {e}")))?;
    if crls.is_empty() {
        return Err(cert_err("no CRLs found in PEM"));
    }
    Ok(crls)
}

/// Reads the first unencrypted private key from PEM data.
pub(crate) fn pem_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut cursor = Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(cert_err("no unencrypted private key found in PEM")),
        Err(e) => Err(cert_err(format!("invalid private key PEM: {e}"))),
    }
}
