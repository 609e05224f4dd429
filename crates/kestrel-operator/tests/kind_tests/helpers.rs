//! Shared fixtures for live-cluster tests

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use kestrel_common::{AssemblyType, Labels};
use kestrel_operator::config::EnvSource;
use kestrel_operator::{startup, AssemblyOperator, OperatorConfig};

/// Fixed variables instead of the process environment
pub struct TestEnv(pub HashMap<&'static str, String>);

impl EnvSource for TestEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Client from the default kubeconfig
pub async fn client() -> Client {
    Client::try_default()
        .await
        .expect("a reachable cluster is required for kind tests")
}

/// Create `name`, replacing any leftover from an earlier run
pub async fn fresh_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
    for _ in 0..60 {
        if api.get_opt(name).await.expect("get namespace").is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &namespace)
        .await
        .expect("create namespace");
}

/// Operator for `assembly_type` watching only `namespace`
pub fn operator(
    client: Client,
    namespace: &str,
    assembly_type: AssemblyType,
) -> Arc<AssemblyOperator> {
    let env = TestEnv(HashMap::from([
        ("KESTREL_NAMESPACE", namespace.to_string()),
        ("KESTREL_LOCK_TIMEOUT_MS", "10000".to_string()),
    ]));
    let config = OperatorConfig::from_env(&env).expect("config");
    let context = startup::kube_context(client, &config, "kind-test");
    Arc::new(AssemblyOperator::for_type(&context, assembly_type))
}

/// Configuration ConfigMap for one assembly
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
