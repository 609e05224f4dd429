//! Per-kind resource operators
//!
//! Every managed kind is handled through the same capability interface,
//! [`ResourceOperator`]. One kube-rs implementation over [`DynamicObject`]
//! serves every kind; [`ResourceOperators`] maps kinds to implementations.

mod stores;

pub use stores::{
    ConfigMapOperations, KubeConfigMapOperations, KubeSecretOperations, SecretOperations,
};
#[cfg(test)]
pub use stores::{MockConfigMapOperations, MockSecretOperations};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use kestrel_common::{Error, Labels, Result, FIELD_MANAGER};

/// Kinds of platform resources the operator manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Secret
    Secret,
    /// core/v1 Service
    Service,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 Deployment
    Deployment,
    /// core/v1 PersistentVolumeClaim
    PersistentVolumeClaim,
    /// apps.openshift.io/v1 DeploymentConfig
    DeploymentConfig,
    /// build.openshift.io/v1 BuildConfig
    BuildConfig,
    /// image.openshift.io/v1 ImageStream
    ImageStream,
}

impl ResourceKind {
    /// Every kind, in a stable order
    pub const ALL: [ResourceKind; 9] = [
        Self::ConfigMap,
        Self::Secret,
        Self::Service,
        Self::StatefulSet,
        Self::Deployment,
        Self::PersistentVolumeClaim,
        Self::DeploymentConfig,
        Self::BuildConfig,
        Self::ImageStream,
    ];

    /// (group, version, kind, plural)
    fn gvkp(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Self::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            Self::Secret => ("", "v1", "Secret", "secrets"),
            Self::Service => ("", "v1", "Service", "services"),
            Self::StatefulSet => ("apps", "v1", "StatefulSet", "statefulsets"),
            Self::Deployment => ("apps", "v1", "Deployment", "deployments"),
            Self::PersistentVolumeClaim => {
                ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims")
            }
            Self::DeploymentConfig => ("apps.openshift.io", "v1", "DeploymentConfig", "deploymentconfigs"),
            Self::BuildConfig => ("build.openshift.io", "v1", "BuildConfig", "buildconfigs"),
            Self::ImageStream => ("image.openshift.io", "v1", "ImageStream", "imagestreams"),
        }
    }

    /// Kind name as it appears in manifests
    pub fn as_str(&self) -> &'static str {
        self.gvkp().2
    }

    /// `apiVersion` of this kind
    pub fn api_version(&self) -> String {
        let (group, version, _, _) = self.gvkp();
        if group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", group, version)
        }
    }

    /// API resource for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = self.gvkp();
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
    }

    /// Whether the kind has `spec.replicas` and supports scale steps
    pub fn is_scalable(&self) -> bool {
        matches!(
            self,
            Self::StatefulSet | Self::Deployment | Self::DeploymentConfig
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reconcile call did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The desired object was applied
    Applied,
    /// The resource was deleted
    Deleted,
    /// Deletion was requested but the resource didn't exist
    AlreadyAbsent,
}

/// `spec.replicas` of a live object, if it has one
pub fn replicas(obj: &DynamicObject) -> Option<i32> {
    obj.data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .map(|r| r as i32)
}

/// Capability interface implemented per resource kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceOperator: Send + Sync {
    /// Kind this operator manages
    fn kind(&self) -> ResourceKind;

    /// Get a resource; `None` if it doesn't exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;

    /// List resources carrying every label in `selector`
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<DynamicObject>>;

    /// Make the resource match `desired`, or delete it when `desired` is `None`
    ///
    /// Deleting an absent resource succeeds.
    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        desired: Option<DynamicObject>,
    ) -> Result<ReconcileOutcome>;

    /// Raise `spec.replicas` to `replicas` if it is currently lower
    ///
    /// Returns the replica count after the call, `None` if the resource is absent.
    async fn scale_up(&self, namespace: &str, name: &str, replicas: i32) -> Result<Option<i32>>;

    /// Lower `spec.replicas` to `replicas` if it is currently higher
    ///
    /// Returns the replica count after the call, `None` if the resource is absent.
    async fn scale_down(&self, namespace: &str, name: &str, replicas: i32)
        -> Result<Option<i32>>;
}

/// [`ResourceOperator`] backed by the Kubernetes API
pub struct KubeResourceOperator {
    client: Client,
    kind: ResourceKind,
    api_resource: ApiResource,
}

impl KubeResourceOperator {
    /// Create an operator for `kind`
    pub fn new(client: Client, kind: ResourceKind) -> Self {
        Self {
            client,
            kind,
            api_resource: kind.api_resource(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.api_resource)
    }

    fn failure(&self, operation: &str, namespace: &str, name: &str, e: kube::Error) -> Error {
        Error::resource_operation(operation, self.kind.as_str(), namespace, name, e.to_string())
    }

    async fn scale(
        &self,
        namespace: &str,
        name: &str,
        target: i32,
        up: bool,
    ) -> Result<Option<i32>> {
        let operation = if up { "scale-up" } else { "scale-down" };
        let Some(live) = self.get(namespace, name).await? else {
            return Ok(None);
        };
        let current = replicas(&live).unwrap_or(0);
        if !scale_moves(current, target, up) {
            debug!(
                kind = %self.kind,
                namespace = %namespace,
                name = %name,
                current,
                target,
                "no scaling needed"
            );
            return Ok(Some(current));
        }

        let patch = json!({ "spec": { "replicas": target } });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.failure(operation, namespace, name, e))?;

        info!(
            kind = %self.kind,
            namespace = %namespace,
            name = %name,
            from = current,
            to = target,
            "scaled"
        );
        Ok(Some(target))
    }
}

/// Whether moving from `current` to `target` goes in the requested direction
fn scale_moves(current: i32, target: i32, up: bool) -> bool {
    if up {
        current < target
    } else {
        current > target
    }
}

#[async_trait]
impl ResourceOperator for KubeResourceOperator {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        match self.api(namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(self.failure("get", namespace, name, e)),
        }
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(&selector.selector_string());
        self.api(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| self.failure("list", namespace, "", e))
    }

    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        desired: Option<DynamicObject>,
    ) -> Result<ReconcileOutcome> {
        let api = self.api(namespace);
        match desired {
            Some(obj) => {
                api.patch(
                    name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&obj),
                )
                .await
                .map_err(|e| self.failure("reconcile", namespace, name, e))?;
                debug!(kind = %self.kind, namespace = %namespace, name = %name, "applied");
                Ok(ReconcileOutcome::Applied)
            }
            None => match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => {
                    debug!(kind = %self.kind, namespace = %namespace, name = %name, "deleted");
                    Ok(ReconcileOutcome::Deleted)
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(ReconcileOutcome::AlreadyAbsent),
                Err(e) => Err(self.failure("delete", namespace, name, e)),
            },
        }
    }

    async fn scale_up(&self, namespace: &str, name: &str, replicas: i32) -> Result<Option<i32>> {
        self.scale(namespace, name, replicas, true).await
    }

    async fn scale_down(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<Option<i32>> {
        self.scale(namespace, name, replicas, false).await
    }
}

/// Kind to operator lookup
#[derive(Clone, Default)]
pub struct ResourceOperators {
    operators: HashMap<ResourceKind, Arc<dyn ResourceOperator>>,
}

impl ResourceOperators {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a kube-backed operator for every kind
    pub fn kube(client: Client) -> Self {
        ResourceKind::ALL
            .into_iter()
            .fold(Self::new(), |ops, kind| {
                ops.with(Arc::new(KubeResourceOperator::new(client.clone(), kind)))
            })
    }

    /// Register `operator` for the kind it reports
    pub fn with(mut self, operator: Arc<dyn ResourceOperator>) -> Self {
        self.operators.insert(operator.kind(), operator);
        self
    }

    /// Operator for `kind`
    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceOperator>> {
        self.operators.get(&kind).cloned().ok_or_else(|| {
            Error::internal_with_context(
                "resource-operators",
                format!("no operator registered for {}", kind),
            )
        })
    }
}
