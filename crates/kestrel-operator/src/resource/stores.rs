//! Typed stores for configuration and credential resources

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use kestrel_common::{Error, Labels, Result, FIELD_MANAGER};

/// Read access to configuration resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapOperations: Send + Sync {
    /// Get a ConfigMap; `None` if absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// List ConfigMaps carrying every label in `selector`
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ConfigMap>>;
}

/// Access to credential resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretOperations: Send + Sync {
    /// Get a Secret; `None` if absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// List Secrets carrying every label in `selector`
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<Secret>>;

    /// Apply `desired`, or delete the Secret when `desired` is `None`
    async fn reconcile(&self, namespace: &str, name: &str, desired: Option<Secret>)
        -> Result<()>;
}

fn failure(operation: &str, kind: &str, namespace: &str, name: &str, e: kube::Error) -> Error {
    Error::resource_operation(operation, kind, namespace, name, e.to_string())
}

/// [`ConfigMapOperations`] backed by the Kubernetes API
pub struct KubeConfigMapOperations {
    client: Client,
}

impl KubeConfigMapOperations {
    /// Create the store
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigMapOperations for KubeConfigMapOperations {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| failure("get", "ConfigMap", namespace, name, e))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector.selector_string());
        api.list(&params)
            .await
            .map(|l| l.items)
            .map_err(|e| failure("list", "ConfigMap", namespace, "", e))
    }
}

/// [`SecretOperations`] backed by the Kubernetes API
pub struct KubeSecretOperations {
    client: Client,
}

impl KubeSecretOperations {
    /// Create the store
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretOperations for KubeSecretOperations {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| failure("get", "Secret", namespace, name, e))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector.selector_string());
        api.list(&params)
            .await
            .map(|l| l.items)
            .map_err(|e| failure("list", "Secret", namespace, "", e))
    }

    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        desired: Option<Secret>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match desired {
            Some(secret) => api
                .patch(
                    name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&secret),
                )
                .await
                .map(|_| ())
                .map_err(|e| failure("reconcile", "Secret", namespace, name, e)),
            None => match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(failure("delete", "Secret", namespace, name, e)),
            },
        }
    }
}
