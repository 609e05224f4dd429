//! Certificate inspection and leaf verification

use x509_parser::prelude::*;

use crate::{parse_pem, PkiError, Result};

/// Validity window and subject of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organization
    pub organization: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name: first_attr(cert.subject().iter_common_name()),
            organization: first_attr(cert.subject().iter_organization()),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Whether `now` (Unix seconds) lies inside the validity window
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        unix_now() > self.not_after
    }
}

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> String {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("")
        .to_string()
}

fn unix_now() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Outcome of verifying a member certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// Whether the certificate can be kept
    pub valid: bool,
    /// Reason if invalid
    pub reason: Option<String>,
}

impl VerificationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Verify a member certificate was signed by `ca_cert_pem`, is currently
/// valid, and carries `expected_cn`
///
/// Returns `Err` only when the inputs can't be parsed at all.
pub fn verify_member_cert(
    cert_pem: &str,
    ca_cert_pem: &str,
    expected_cn: &str,
) -> Result<VerificationResult> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse member cert: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(VerificationResult::rejected("signature verification failed"));
    }

    let now = unix_now();
    if now < cert.validity().not_before.timestamp() {
        return Ok(VerificationResult::rejected("certificate not yet valid"));
    }
    if now > cert.validity().not_after.timestamp() {
        return Ok(VerificationResult::rejected("certificate expired"));
    }

    let cn = first_attr(cert.subject().iter_common_name());
    if cn != expected_cn {
        return Ok(VerificationResult::rejected(format!(
            "common name '{}' does not match '{}'",
            cn, expected_cn
        )));
    }

    Ok(VerificationResult::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{CertManager, RcgenCertManager};
    use crate::{CertAndKey, Subject};

    fn issue(manager: &RcgenCertManager, ca: &CertAndKey, cn: &str, days: u32) -> String {
        let request = manager
            .generate_csr(&Subject::new(cn))
            .expect("CSR generation should succeed");
        manager
            .sign(&request.csr_pem, ca, days)
            .expect("signing should succeed")
    }

    #[test]
    fn leaf_from_other_ca_is_rejected() {
        let manager = RcgenCertManager::new();
        let ca1 = manager
            .generate_self_signed(&Subject::new("ca-one"), 30)
            .expect("CA1");
        let ca2 = manager
            .generate_self_signed(&Subject::new("ca-two"), 30)
            .expect("CA2");
        let leaf = issue(&manager, &ca1, "c-kafka-0", 30);

        let result = verify_member_cert(&leaf, &ca2.cert_pem, "c-kafka-0").expect("parse");
        assert!(!result.valid);
        assert_eq!(
            result.reason.as_deref(),
            Some("signature verification failed")
        );
    }

    #[test]
    fn leaf_with_wrong_common_name_is_rejected() {
        let manager = RcgenCertManager::new();
        let ca = manager
            .generate_self_signed(&Subject::new("internal-ca"), 30)
            .expect("CA");
        let leaf = issue(&manager, &ca, "c-kafka-0", 30);

        let result = verify_member_cert(&leaf, &ca.cert_pem, "c-kafka-1").expect("parse");
        assert!(!result.valid);
    }

    #[test]
    fn leaf_with_zero_validity_is_expired() {
        let manager = RcgenCertManager::new();
        let ca = manager
            .generate_self_signed(&Subject::new("internal-ca"), 30)
            .expect("CA");
        let leaf = issue(&manager, &ca, "c-kafka-0", 0);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let result = verify_member_cert(&leaf, &ca.cert_pem, "c-kafka-0").expect("parse");
        assert_eq!(result.reason.as_deref(), Some("certificate expired"));
    }

    #[test]
    fn garbage_input_is_a_parse_error() {
        assert!(verify_member_cert("nope", "nope", "x").is_err());
    }

    #[test]
    fn info_reports_window() {
        let manager = RcgenCertManager::new();
        let ca = manager
            .generate_self_signed(&Subject::new("internal-ca"), 10)
            .expect("CA");
        let info = CertificateInfo::from_pem(&ca.cert_pem).expect("parse");
        assert!(info.is_valid_at(unix_now()));
        assert!(!info.is_expired());
        assert_eq!(info.lifetime_secs(), 10 * 86_400);
    }
}
