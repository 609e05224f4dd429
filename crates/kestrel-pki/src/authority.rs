//! Trust domains, authorities and member certificate issuance

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::manager::CertManager;
use crate::verify::verify_member_cert;
use crate::{CertAndKey, PkiError, Result, Subject, VALIDITY_DAYS};

/// One of the two independent certificate hierarchies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrustDomain {
    /// Member-to-member communication
    Internal,
    /// External client-to-member communication
    Clients,
}

impl TrustDomain {
    /// Both domains
    pub const ALL: [TrustDomain; 2] = [Self::Internal, Self::Clients];

    /// Name of the domain's authority; also the namespace Secret holding it
    pub fn ca_name(&self) -> &'static str {
        match self {
            Self::Internal => "internal-ca",
            Self::Clients => "clients-ca",
        }
    }

    /// Artifact name of the authority's private key
    pub fn ca_key_artifact(&self) -> String {
        format!("{}.key", self.ca_name())
    }

    /// Artifact name of the authority's certificate
    pub fn ca_cert_artifact(&self) -> String {
        format!("{}.crt", self.ca_name())
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "internal",
            Self::Clients => "clients",
        })
    }
}

/// Generate a fresh self-signed authority for `domain`
pub fn generate_authority(manager: &dyn CertManager, domain: TrustDomain) -> Result<CertAndKey> {
    manager.generate_self_signed(&Subject::new(domain.ca_name()), VALIDITY_DAYS)
}

/// The leaf certificates of one cluster in one trust domain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberCertificates {
    /// Certificate of the authority that signed every member
    pub ca_cert_pem: String,
    /// Member name to key/certificate
    pub members: BTreeMap<String, CertAndKey>,
}

impl MemberCertificates {
    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if there are no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Look up one member
    pub fn get(&self, member: &str) -> Option<&CertAndKey> {
        self.members.get(member)
    }
}

/// Issue one leaf per member, signed by `ca`
///
/// A member keeps its certificate from `existing` only when `existing` was
/// signed by this very authority and the leaf still verifies, is unexpired
/// and carries the member's name. Everything else is issued fresh. Members
/// of `existing` not in `member_names` are dropped. The first generation or
/// signing failure aborts the whole issuance.
pub fn issue_member_certificates(
    manager: &dyn CertManager,
    ca: &CertAndKey,
    member_names: &[String],
    existing: Option<&MemberCertificates>,
) -> Result<MemberCertificates> {
    let reusable = existing.filter(|e| e.ca_cert_pem == ca.cert_pem);

    let mut members = BTreeMap::new();
    let mut reused = 0usize;
    for name in member_names {
        if let Some(previous) = reusable.and_then(|e| e.get(name)) {
            if leaf_still_valid(previous, &ca.cert_pem, name) {
                members.insert(name.clone(), previous.clone());
                reused += 1;
                continue;
            }
        }

        let request = manager
            .generate_csr(&Subject::new(name.as_str()))
            .map_err(|e| member_failure(name, e))?;
        let cert_pem = manager
            .sign(&request.csr_pem, ca, VALIDITY_DAYS)
            .map_err(|e| member_failure(name, e))?;
        members.insert(name.clone(), CertAndKey::new(request.key_pem, cert_pem));
    }

    debug!(
        members = member_names.len(),
        reused,
        issued = member_names.len() - reused,
        "member certificates ready"
    );
    Ok(MemberCertificates {
        ca_cert_pem: ca.cert_pem.clone(),
        members,
    })
}

fn leaf_still_valid(leaf: &CertAndKey, ca_cert_pem: &str, member: &str) -> bool {
    !leaf.key_pem.is_empty()
        && verify_member_cert(&leaf.cert_pem, ca_cert_pem, member)
            .map(|r| r.valid)
            .unwrap_or(false)
}

fn member_failure(member: &str, e: PkiError) -> PkiError {
    PkiError::CertificateGenerationFailed(format!("{}: {}", member, e))
}
