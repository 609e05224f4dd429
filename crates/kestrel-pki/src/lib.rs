//! PKI for kestrel assemblies
//!
//! Every namespace has two certificate authorities, one per trust domain:
//! `internal-ca` signs the certificates members use to talk to each other,
//! `clients-ca` signs the certificates members present to external clients.
//! Each cluster member gets one leaf per trust domain, with common name
//! `<cluster>-<kind>-<index>`.
//!
//! Key material is generated in memory with rcgen; nothing touches the
//! filesystem. Generation is CPU-bound and synchronous, so callers run it on
//! a blocking worker pool.

#![deny(missing_docs)]

pub mod authority;
pub mod bundle;
pub mod manager;
pub mod verify;

pub use authority::{
    generate_authority, issue_member_certificates, MemberCertificates, TrustDomain,
};
pub use bundle::CredentialBundle;
pub use manager::{CertManager, RcgenCertManager};
pub use verify::{verify_member_cert, CertificateInfo, VerificationResult};

use thiserror::Error;

/// Fixed organization in every subject we issue
pub const ORGANIZATION: &str = "io.kestrel";

/// Validity of authorities and member certificates
pub const VALIDITY_DAYS: u32 = 365;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or signing request generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// A credential bundle lacks an artifact
    #[error("credential bundle is missing {0}")]
    MissingArtifact(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

impl From<PkiError> for kestrel_common::Error {
    fn from(e: PkiError) -> Self {
        kestrel_common::Error::certificate_generation("pki", e.to_string())
    }
}

/// Subject of a certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    /// Organization (O)
    pub organization: String,
    /// Common name (CN)
    pub common_name: String,
}

impl Subject {
    /// Subject in the kestrel organization
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            organization: ORGANIZATION.to_string(),
            common_name: common_name.into(),
        }
    }
}

/// A PEM-encoded private key and certificate
#[derive(Clone, PartialEq, Eq)]
pub struct CertAndKey {
    /// PKCS#8 private key, PEM
    pub key_pem: String,
    /// X.509 certificate, PEM
    pub cert_pem: String,
}

impl CertAndKey {
    /// Pair a key with its certificate
    pub fn new(key_pem: impl Into<String>, cert_pem: impl Into<String>) -> Self {
        Self {
            key_pem: key_pem.into(),
            cert_pem: cert_pem.into(),
        }
    }
}

impl std::fmt::Debug for CertAndKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAndKey")
            .field("key_pem", &"<redacted>")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish()
    }
}

/// A freshly generated private key and the signing request for it
#[derive(Clone)]
pub struct SigningRequest {
    /// PKCS#8 private key, PEM
    pub key_pem: String,
    /// PKCS#10 signing request, PEM
    pub csr_pem: String,
}

impl std::fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRequest")
            .field("key_pem", &"<redacted>")
            .field("csr_pem", &self.csr_pem)
            .finish()
    }
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}
