//! Certificate lifecycle: namespace authorities and member certificates
//!
//! Both authorities are shared by every cluster in a namespace and stored in
//! the Secrets `internal-ca` and `clients-ca`. Creation is serialized per
//! namespace through the lock service, so two clusters reconciling at once
//! cannot both generate. Key generation and signing run on the worker pool.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use kestrel_common::{Error, LockService, Result, WorkerPool};
use kestrel_pki::{
    generate_authority, issue_member_certificates, CertAndKey, CertManager, CredentialBundle,
    MemberCertificates, TrustDomain,
};

use crate::model::ClusterCertificates;
use crate::resource::SecretOperations;

/// Lock guarding authority creation in `namespace`
pub fn authority_lock_name(namespace: &str) -> String {
    format!("lock::{}::certificate-authority", namespace)
}

/// Decode the artifacts of a stored Secret
pub fn secret_bundle(secret: &Secret) -> CredentialBundle {
    CredentialBundle::from_data(
        secret
            .data
            .as_ref()
            .map(|data| data.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default(),
    )
}

/// The two namespace authorities
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorities {
    /// Signs member-to-member certificates
    pub internal: CertAndKey,
    /// Signs certificates presented to clients
    pub clients: CertAndKey,
}

impl Authorities {
    /// Authority of `domain`
    pub fn get(&self, domain: TrustDomain) -> &CertAndKey {
        match domain {
            TrustDomain::Internal => &self.internal,
            TrustDomain::Clients => &self.clients,
        }
    }
}

/// Credential state loaded before the diff phase
#[derive(Clone, Debug)]
pub struct Credentials {
    /// Namespace authorities
    pub authorities: Authorities,
    /// Existing credential Secrets of the cluster
    pub secrets: Vec<Secret>,
}

impl Credentials {
    /// Member certificates stored in the Secret called `name`, if readable
    pub fn members(&self, name: &str, domain: TrustDomain) -> Option<MemberCertificates> {
        let secret = self
            .secrets
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(name))?;
        match secret_bundle(secret).to_members(domain) {
            Ok(members) => Some(members),
            Err(e) => {
                debug!(secret = %name, error = %e, "unreadable member bundle, reissuing");
                None
            }
        }
    }
}

/// Ensures the namespace authorities exist
pub struct AuthorityManager {
    secrets: Arc<dyn SecretOperations>,
    locks: Arc<dyn LockService>,
    cert_manager: Arc<dyn CertManager>,
    pool: WorkerPool,
    lock_timeout: Duration,
}

impl AuthorityManager {
    /// Create the manager
    pub fn new(
        secrets: Arc<dyn SecretOperations>,
        locks: Arc<dyn LockService>,
        cert_manager: Arc<dyn CertManager>,
        pool: WorkerPool,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            secrets,
            locks,
            cert_manager,
            pool,
            lock_timeout,
        }
    }

    /// Load both authorities of `namespace`, generating whichever is missing
    ///
    /// Idempotent. A stored authority that cannot be decoded is an error,
    /// never silently replaced: replacing it would invalidate every member
    /// certificate in the namespace.
    pub async fn ensure_authorities(&self, namespace: &str) -> Result<Authorities> {
        if let (Some(internal), Some(clients)) = (
            self.load(namespace, TrustDomain::Internal).await?,
            self.load(namespace, TrustDomain::Clients).await?,
        ) {
            return Ok(Authorities { internal, clients });
        }

        let lock = self
            .locks
            .acquire(&authority_lock_name(namespace), self.lock_timeout)
            .await?;
        let result = self.ensure_locked(namespace).await;
        if let Err(e) = lock.release().await {
            warn!(namespace = %namespace, error = %e, "failed to release authority lock");
        }
        result
    }

    async fn ensure_locked(&self, namespace: &str) -> Result<Authorities> {
        Ok(Authorities {
            internal: self.ensure_one(namespace, TrustDomain::Internal).await?,
            clients: self.ensure_one(namespace, TrustDomain::Clients).await?,
        })
    }

    async fn ensure_one(&self, namespace: &str, domain: TrustDomain) -> Result<CertAndKey> {
        if let Some(existing) = self.load(namespace, domain).await? {
            return Ok(existing);
        }

        let cert_manager = Arc::clone(&self.cert_manager);
        let authority = self
            .pool
            .run(domain.ca_name(), move || {
                generate_authority(cert_manager.as_ref(), domain)
            })
            .await??;

        let name = domain.ca_name();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                CredentialBundle::authority(domain, &authority)
                    .into_data()
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        };
        self.secrets.reconcile(namespace, name, Some(secret)).await?;
        info!(namespace = %namespace, authority = %name, "generated certificate authority");
        Ok(authority)
    }

    async fn load(&self, namespace: &str, domain: TrustDomain) -> Result<Option<CertAndKey>> {
        let name = domain.ca_name();
        let Some(secret) = self.secrets.get(namespace, name).await? else {
            return Ok(None);
        };
        secret_bundle(&secret)
            .to_authority(domain)
            .map(Some)
            .map_err(|e| {
                Error::certificate_generation(
                    format!("{}/{}", namespace, name),
                    format!("stored authority is unreadable: {}", e),
                )
            })
    }
}

/// Issues member certificates for one cluster
#[derive(Clone)]
pub struct MemberIssuer {
    cert_manager: Arc<dyn CertManager>,
    pool: WorkerPool,
}

impl MemberIssuer {
    /// Create the issuer
    pub fn new(cert_manager: Arc<dyn CertManager>, pool: WorkerPool) -> Self {
        Self { cert_manager, pool }
    }

    /// Issue leaves for `members` in both trust domains
    ///
    /// `existing` looks up the certificates already stored for a domain;
    /// valid ones signed by the current authority are kept.
    pub async fn issue(
        &self,
        authorities: &Authorities,
        members: &[String],
        existing: impl Fn(TrustDomain) -> Option<MemberCertificates>,
    ) -> Result<ClusterCertificates> {
        Ok(ClusterCertificates {
            internal: self
                .issue_domain(
                    TrustDomain::Internal,
                    authorities,
                    members,
                    existing(TrustDomain::Internal),
                )
                .await?,
            clients: self
                .issue_domain(
                    TrustDomain::Clients,
                    authorities,
                    members,
                    existing(TrustDomain::Clients),
                )
                .await?,
        })
    }

    async fn issue_domain(
        &self,
        domain: TrustDomain,
        authorities: &Authorities,
        members: &[String],
        existing: Option<MemberCertificates>,
    ) -> Result<MemberCertificates> {
        let cert_manager = Arc::clone(&self.cert_manager);
        let ca = authorities.get(domain).clone();
        let members = members.to_vec();
        let context = format!("{}-members", domain);
        let certs = self
            .pool
            .run(&context, move || {
                issue_member_certificates(cert_manager.as_ref(), &ca, &members, existing.as_ref())
            })
            .await??;
        Ok(certs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingCertManager, FakeSecrets};
    use kestrel_common::InMemoryLockService;
    use kestrel_pki::verify_member_cert;

    fn manager(secrets: Arc<FakeSecrets>, certs: Arc<CountingCertManager>) -> AuthorityManager {
        AuthorityManager::new(
            secrets,
            Arc::new(InMemoryLockService::new()),
            certs,
            WorkerPool::new(4),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn generates_both_authorities_once() {
        let secrets = Arc::new(FakeSecrets::default());
        let certs = Arc::new(CountingCertManager::new());
        let authorities = manager(secrets.clone(), certs.clone());

        let first = authorities.ensure_authorities("test").await.expect("generated");
        let second = authorities.ensure_authorities("test").await.expect("loaded");

        assert_eq!(first, second);
        assert_eq!(certs.self_signed(), 2);
        assert!(secrets.stored("test", "internal-ca").is_some());
        assert!(secrets.stored("test", "clients-ca").is_some());
        assert_ne!(first.internal.cert_pem, first.clients.cert_pem);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_generation() {
        let secrets = Arc::new(FakeSecrets::default());
        let certs = Arc::new(CountingCertManager::new());
        let authorities = Arc::new(manager(secrets, certs.clone()));

        let (a, b) = tokio::join!(
            authorities.ensure_authorities("test"),
            authorities.ensure_authorities("test")
        );
        assert_eq!(a.expect("first"), b.expect("second"));
        assert_eq!(certs.self_signed(), 2);
    }

    #[tokio::test]
    async fn corrupt_authority_is_an_error() {
        let secrets = Arc::new(FakeSecrets::default());
        secrets.insert(Secret {
            metadata: ObjectMeta {
                name: Some("internal-ca".to_string()),
                namespace: Some("test".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let certs = Arc::new(CountingCertManager::new());
        let err = manager(secrets, certs.clone())
            .ensure_authorities("test")
            .await
            .expect_err("corrupt");
        assert!(matches!(err, Error::CertificateGeneration { .. }));
        assert_eq!(certs.self_signed(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_fails_the_pass() {
        let mut secrets = crate::resource::MockSecretOperations::new();
        secrets.expect_get().returning(|_, _| Ok(None));
        secrets.expect_reconcile().times(1).returning(|ns, name, _| {
            Err(Error::resource_operation("reconcile", "Secret", ns, name, "forbidden"))
        });
        let authorities = AuthorityManager::new(
            Arc::new(secrets),
            Arc::new(InMemoryLockService::new()),
            Arc::new(CountingCertManager::new()),
            WorkerPool::new(1),
            Duration::from_secs(5),
        );
        let err = authorities.ensure_authorities("test").await.expect_err("fails");
        assert!(matches!(err, Error::ResourceOperation { .. }));
    }

    #[tokio::test]
    async fn issues_members_in_both_domains() {
        let certs = Arc::new(CountingCertManager::new());
        let authorities = manager(Arc::new(FakeSecrets::default()), certs.clone())
            .ensure_authorities("test")
            .await
            .expect("authorities");
        let issuer = MemberIssuer::new(certs.clone(), WorkerPool::new(2));
        let members: Vec<String> = (0..3).map(|i| format!("c-kafka-{i}")).collect();

        let issued = issuer
            .issue(&authorities, &members, |_| None)
            .await
            .expect("issued");
        for domain in TrustDomain::ALL {
            let domain_certs = issued.domain(domain);
            assert_eq!(domain_certs.len(), 3);
            for name in &members {
                let leaf = domain_certs.get(name).expect("member");
                let result =
                    verify_member_cert(&leaf.cert_pem, &authorities.get(domain).cert_pem, name)
                        .expect("parsable");
                assert!(result.valid, "{domain} {name}: {:?}", result.reason);
            }
        }
        assert_eq!(certs.signed(), 6);

        let again = issuer
            .issue(&authorities, &members, |d| Some(issued.domain(d).clone()))
            .await
            .expect("reissued");
        assert_eq!(again, issued);
        assert_eq!(certs.signed(), 6);
    }
}
