//! The certificate primitive
//!
//! [`CertManager`] is the only thing that generates keys and signs
//! certificates. The reconciliation engine treats it as opaque and tests
//! substitute a mock to count or fail generations.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};

#[cfg(test)]
use mockall::automock;

use crate::{CertAndKey, PkiError, Result, SigningRequest, Subject};

/// Generates self-signed authorities, signing requests and signed leaves
#[cfg_attr(test, automock)]
pub trait CertManager: Send + Sync {
    /// Generate a key and a self-signed CA certificate valid for `validity_days`
    fn generate_self_signed(&self, subject: &Subject, validity_days: u32) -> Result<CertAndKey>;

    /// Generate a key and a signing request for `subject`
    fn generate_csr(&self, subject: &Subject) -> Result<SigningRequest>;

    /// Sign `csr_pem` with the authority, returning the certificate PEM
    fn sign(&self, csr_pem: &str, ca: &CertAndKey, validity_days: u32) -> Result<String>;
}

/// [`CertManager`] backed by rcgen
#[derive(Clone, Copy, Debug, Default)]
pub struct RcgenCertManager;

impl RcgenCertManager {
    /// Create the rcgen-backed manager
    pub fn new() -> Self {
        Self
    }
}

fn distinguished_name(subject: &Subject) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(subject.organization.clone()),
    );
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(subject.common_name.clone()),
    );
    dn
}

fn compute_validity(days: u32) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(i64::from(days));
    (now, not_after)
}

impl CertManager for RcgenCertManager {
    fn generate_self_signed(&self, subject: &Subject, validity_days: u32) -> Result<CertAndKey> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(subject);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(CertAndKey::new(key_pair.serialize_pem(), cert.pem()))
    }

    fn generate_csr(&self, subject: &Subject) -> Result<SigningRequest> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate key for {}: {}",
                subject.common_name, e
            ))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(subject);
        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(SigningRequest {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    fn sign(&self, csr_pem: &str, ca: &CertAndKey, validity_days: u32) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        // The subject comes from the CSR; everything else is ours
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        let (not_before, not_after) = compute_validity(validity_days);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;
        Ok(signed.pem())
    }
}
