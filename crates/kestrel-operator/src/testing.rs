//! In-memory fakes for collaborators that must remember what was written

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde_json::Value;

use kestrel_common::{AssemblyType, Error, InMemoryLockService, Labels, Result, WorkerPool};
use kestrel_pki::{CertAndKey, CertManager, RcgenCertManager, SigningRequest, Subject};

use crate::assembly::{AssemblyOperator, OperatorContext};
use crate::config::DefaultImages;
use crate::resource::{
    self, ConfigMapOperations, ReconcileOutcome, ResourceKind, ResourceOperator,
    ResourceOperators, SecretOperations,
};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

/// Configuration store backed by a map
#[derive(Default)]
pub struct FakeConfigMaps {
    maps: DashMap<Key, ConfigMap>,
}

impl FakeConfigMaps {
    pub fn insert(&self, config: ConfigMap) {
        self.maps.insert(meta_key(&config.metadata), config);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.maps.remove(&key(namespace, name));
    }
}

#[async_trait]
impl ConfigMapOperations for FakeConfigMaps {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.maps.get(&key(namespace, name)).map(|e| e.value().clone()))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ConfigMap>> {
        Ok(self
            .maps
            .iter()
            .filter(|e| e.key().0 == namespace && selector.matches(&e.value().metadata))
            .map(|e| e.value().clone())
            .collect())
    }
}

/// Credential store sharing its objects with the Secret resource operator
pub struct FakeSecrets {
    store: Arc<FakeResourceOperator>,
    writes: AtomicUsize,
}

impl Default for FakeSecrets {
    fn default() -> Self {
        Self::backed_by(Arc::new(FakeResourceOperator::new(ResourceKind::Secret)))
    }
}

fn secret_to_dynamic(secret: &Secret) -> DynamicObject {
    serde_json::to_value(secret)
        .and_then(serde_json::from_value)
        .expect("secret converts to a dynamic object")
}

fn dynamic_to_secret(obj: &DynamicObject) -> Secret {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .expect("dynamic object converts to a secret")
}

impl FakeSecrets {
    pub fn backed_by(store: Arc<FakeResourceOperator>) -> Self {
        Self {
            store,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, secret: Secret) {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        self.store.insert(&namespace, secret_to_dynamic(&secret));
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.store
            .stored(namespace, name)
            .map(|obj| dynamic_to_secret(&obj))
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretOperations for FakeSecrets {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.stored(namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<Secret>> {
        Ok(ResourceOperator::list(self.store.as_ref(), namespace, selector)
            .await?
            .iter()
            .map(dynamic_to_secret)
            .collect())
    }

    async fn reconcile(&self, namespace: &str, name: &str, desired: Option<Secret>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.store
            .reconcile(namespace, name, desired.as_ref().map(secret_to_dynamic))
            .await
            .map(|_| ())
    }
}

/// One call made against a [`FakeResourceOperator`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// reconcile with a desired object
    Apply(String),
    /// reconcile with no desired object
    Delete(String),
    /// scale_up to a target
    ScaleUp(String, i32),
    /// scale_down to a target
    ScaleDown(String, i32),
}

/// Resource operator over an in-memory object table, recording every call
pub struct FakeResourceOperator {
    kind: ResourceKind,
    objects: DashMap<Key, DynamicObject>,
    calls: Mutex<Vec<(String, Call)>>,
    failing_deletes: DashMap<Key, ()>,
}

impl FakeResourceOperator {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            objects: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            failing_deletes: DashMap::new(),
        }
    }

    /// Make the next delete of `name` fail
    pub fn fail_next_delete(&self, namespace: &str, name: &str) {
        self.failing_deletes.insert(key(namespace, name), ());
    }

    /// Seed a live object without recording a call
    pub fn insert(&self, namespace: &str, obj: DynamicObject) {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.objects.insert(key(namespace, &name), obj);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects.get(&key(namespace, name)).map(|e| e.value().clone())
    }

    /// Calls made in `namespace`
    pub fn calls(&self, namespace: &str) -> Vec<Call> {
        self.calls
            .lock()
            .map(|calls| {
                calls
                    .iter()
                    .filter(|(ns, _)| ns == namespace)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, namespace: &str, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((namespace.to_string(), call));
        }
    }

    fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) {
        if let Some(mut obj) = self.objects.get_mut(&key(namespace, name)) {
            obj.data["spec"]["replicas"] = Value::from(replicas);
        }
    }
}

#[async_trait]
impl ResourceOperator for FakeResourceOperator {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.stored(namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<DynamicObject>> {
        Ok(self
            .objects
            .iter()
            .filter(|e| e.key().0 == namespace && selector.matches(&e.value().metadata))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        desired: Option<DynamicObject>,
    ) -> Result<ReconcileOutcome> {
        match desired {
            Some(obj) => {
                self.record(namespace, Call::Apply(name.to_string()));
                self.objects.insert(key(namespace, name), obj);
                Ok(ReconcileOutcome::Applied)
            }
            None => {
                self.record(namespace, Call::Delete(name.to_string()));
                if self.failing_deletes.remove(&key(namespace, name)).is_some() {
                    return Err(Error::resource_operation(
                        "delete",
                        self.kind.to_string(),
                        namespace,
                        name,
                        "injected failure",
                    ));
                }
                Ok(match self.objects.remove(&key(namespace, name)) {
                    Some(_) => ReconcileOutcome::Deleted,
                    None => ReconcileOutcome::AlreadyAbsent,
                })
            }
        }
    }

    async fn scale_up(&self, namespace: &str, name: &str, replicas: i32) -> Result<Option<i32>> {
        self.record(namespace, Call::ScaleUp(name.to_string(), replicas));
        let current = self.stored(namespace, name).and_then(|o| resource::replicas(&o));
        match current {
            Some(current) if current < replicas => {
                self.set_replicas(namespace, name, replicas);
                Ok(Some(replicas))
            }
            other => Ok(other),
        }
    }

    async fn scale_down(&self, namespace: &str, name: &str, replicas: i32) -> Result<Option<i32>> {
        self.record(namespace, Call::ScaleDown(name.to_string(), replicas));
        let current = self.stored(namespace, name).and_then(|o| resource::replicas(&o));
        match current {
            Some(current) if current > replicas => {
                self.set_replicas(namespace, name, replicas);
                Ok(Some(replicas))
            }
            other => Ok(other),
        }
    }
}

/// rcgen-backed certificate primitive counting its invocations
pub struct CountingCertManager {
    inner: RcgenCertManager,
    self_signed: AtomicUsize,
    signed: AtomicUsize,
}

impl CountingCertManager {
    pub fn new() -> Self {
        Self {
            inner: RcgenCertManager::new(),
            self_signed: AtomicUsize::new(0),
            signed: AtomicUsize::new(0),
        }
    }

    pub fn self_signed(&self) -> usize {
        self.self_signed.load(Ordering::SeqCst)
    }

    pub fn signed(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

impl CertManager for CountingCertManager {
    fn generate_self_signed(
        &self,
        subject: &Subject,
        validity_days: u32,
    ) -> kestrel_pki::Result<CertAndKey> {
        self.self_signed.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_self_signed(subject, validity_days)
    }

    fn generate_csr(&self, subject: &Subject) -> kestrel_pki::Result<SigningRequest> {
        self.inner.generate_csr(subject)
    }

    fn sign(&self, csr_pem: &str, ca: &CertAndKey, validity_days: u32) -> kestrel_pki::Result<String> {
        self.signed.fetch_add(1, Ordering::SeqCst);
        self.inner.sign(csr_pem, ca, validity_days)
    }
}

/// Every collaborator of an assembly operator, faked
pub struct FakePlatform {
    pub config_maps: Arc<FakeConfigMaps>,
    pub secrets: Arc<FakeSecrets>,
    pub locks: Arc<InMemoryLockService>,
    pub certs: Arc<CountingCertManager>,
    pub resources: BTreeMap<ResourceKind, Arc<FakeResourceOperator>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        let resources: BTreeMap<ResourceKind, Arc<FakeResourceOperator>> = ResourceKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(FakeResourceOperator::new(kind))))
            .collect();
        let secrets = FakeSecrets::backed_by(Arc::clone(&resources[&ResourceKind::Secret]));
        Self {
            config_maps: Arc::new(FakeConfigMaps::default()),
            secrets: Arc::new(secrets),
            locks: Arc::new(InMemoryLockService::new()),
            certs: Arc::new(CountingCertManager::new()),
            resources,
        }
    }

    pub fn resource(&self, kind: ResourceKind) -> &FakeResourceOperator {
        &self.resources[&kind]
    }

    pub fn operators(&self) -> ResourceOperators {
        self.resources
            .values()
            .fold(ResourceOperators::new(), |ops, op| {
                ops.with(Arc::clone(op) as Arc<dyn ResourceOperator>)
            })
    }

    pub fn context(&self) -> OperatorContext {
        OperatorContext {
            config_maps: self.config_maps.clone(),
            secrets: self.secrets.clone(),
            locks: self.locks.clone(),
            cert_manager: self.certs.clone(),
            operators: self.operators(),
            pool: WorkerPool::new(4),
            lock_timeout: Duration::from_secs(10),
            selector: Labels::empty(),
            images: DefaultImages::default(),
        }
    }

    pub fn operator(&self, assembly_type: AssemblyType) -> Arc<AssemblyOperator> {
        Arc::new(AssemblyOperator::for_type(&self.context(), assembly_type))
    }

    pub fn clear_calls(&self) {
        for op in self.resources.values() {
            op.clear_calls();
        }
    }
}

/// Configuration ConfigMap for a cluster of `assembly_type`
pub fn cluster_config(
    assembly_type: AssemblyType,
    namespace: &str,
    name: &str,
    data: &[(&str, &str)],
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(Labels::for_type(assembly_type).with_kind().to_map()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}
