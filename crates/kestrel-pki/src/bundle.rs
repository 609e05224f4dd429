//! Credential bundles: flat artifact-name to bytes maps
//!
//! Three layouts are used:
//!
//! | bundle | artifacts |
//! |---|---|
//! | namespace authority | `<domain>-ca.key`, `<domain>-ca.crt` |
//! | cluster trust | `<domain>-ca.crt` |
//! | cluster members | `<domain>-ca.crt`, `<member>.key`, `<member>.crt` per member |
//!
//! The platform stores the bytes base64-encoded; that encoding happens at
//! the Secret boundary, not here.

use std::collections::BTreeMap;

use crate::authority::{MemberCertificates, TrustDomain};
use crate::{CertAndKey, PkiError, Result};

const KEY_SUFFIX: &str = ".key";
const CERT_SUFFIX: &str = ".crt";

/// Artifact name to bytes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialBundle(BTreeMap<String, Vec<u8>>);

impl CredentialBundle {
    /// Wrap stored artifacts
    pub fn from_data(data: BTreeMap<String, Vec<u8>>) -> Self {
        Self(data)
    }

    /// The artifacts
    pub fn data(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.0
    }

    /// Consume into the artifacts
    pub fn into_data(self) -> BTreeMap<String, Vec<u8>> {
        self.0
    }

    /// Bundle of a namespace authority
    pub fn authority(domain: TrustDomain, ca: &CertAndKey) -> Self {
        let mut data = BTreeMap::new();
        data.insert(domain.ca_key_artifact(), ca.key_pem.as_bytes().to_vec());
        data.insert(domain.ca_cert_artifact(), ca.cert_pem.as_bytes().to_vec());
        Self(data)
    }

    /// Bundle exposing only an authority certificate, for trust distribution
    pub fn trust(domain: TrustDomain, ca_cert_pem: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert(domain.ca_cert_artifact(), ca_cert_pem.as_bytes().to_vec());
        Self(data)
    }

    /// Bundle of every member of a cluster in one domain
    pub fn members(domain: TrustDomain, certs: &MemberCertificates) -> Self {
        let mut data = BTreeMap::new();
        data.insert(
            domain.ca_cert_artifact(),
            certs.ca_cert_pem.as_bytes().to_vec(),
        );
        for (name, pair) in &certs.members {
            data.insert(
                format!("{}{}", name, KEY_SUFFIX),
                pair.key_pem.as_bytes().to_vec(),
            );
            data.insert(
                format!("{}{}", name, CERT_SUFFIX),
                pair.cert_pem.as_bytes().to_vec(),
            );
        }
        Self(data)
    }

    /// Return a copy that also trusts `domain`'s authority
    pub fn with_trust(mut self, domain: TrustDomain, ca_cert_pem: &str) -> Self {
        self.0
            .insert(domain.ca_cert_artifact(), ca_cert_pem.as_bytes().to_vec());
        self
    }

    /// Decode a namespace authority bundle
    pub fn to_authority(&self, domain: TrustDomain) -> Result<CertAndKey> {
        Ok(CertAndKey::new(
            self.text(&domain.ca_key_artifact())?,
            self.text(&domain.ca_cert_artifact())?,
        ))
    }

    /// Decode a member bundle
    ///
    /// A certificate without its key is skipped; it will be reissued.
    pub fn to_members(&self, domain: TrustDomain) -> Result<MemberCertificates> {
        let ca_artifact = domain.ca_cert_artifact();
        let ca_cert_pem = self.text(&ca_artifact)?;

        let mut members = BTreeMap::new();
        for artifact in self.0.keys() {
            if *artifact == ca_artifact {
                continue;
            }
            let Some(member) = artifact.strip_suffix(CERT_SUFFIX) else {
                continue;
            };
            let key_artifact = format!("{}{}", member, KEY_SUFFIX);
            if !self.0.contains_key(&key_artifact) {
                continue;
            }
            members.insert(
                member.to_string(),
                CertAndKey::new(self.text(&key_artifact)?, self.text(artifact)?),
            );
        }

        Ok(MemberCertificates {
            ca_cert_pem,
            members,
        })
    }

    fn text(&self, artifact: &str) -> Result<String> {
        let bytes = self
            .0
            .get(artifact)
            .ok_or_else(|| PkiError::MissingArtifact(artifact.to_string()))?;
        String::from_utf8(bytes.clone())
            .map_err(|e| PkiError::ParseError(format!("{} is not UTF-8: {}", artifact, e)))
    }
}
