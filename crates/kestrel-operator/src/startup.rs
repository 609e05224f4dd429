//! Wiring the operators from configuration

use std::sync::Arc;

use kube::Client;
use tracing::info;

use kestrel_common::{InMemoryLockService, LeaseLockService, LockService, Result, WorkerPool};
use kestrel_pki::RcgenCertManager;

use crate::assembly::{AssemblyOperator, OperatorContext};
use crate::config::{EnvSource, OperatorConfig};
use crate::resource::{KubeConfigMapOperations, KubeSecretOperations, ResourceOperators};

/// Lease holder identity when neither variable is set
const DEFAULT_IDENTITY: &str = "kestrel-operator";

/// Lease holder identity of this process
///
/// `POD_NAME` (downward API) first, then `HOSTNAME`.
pub fn holder_identity(env: &dyn EnvSource) -> String {
    env.var("POD_NAME")
        .or_else(|| env.var("HOSTNAME"))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_IDENTITY.to_string())
}

/// Build the shared collaborators backed by the Kubernetes API
pub fn kube_context(client: Client, config: &OperatorConfig, identity: &str) -> OperatorContext {
    let locks: Arc<dyn LockService> = if config.distributed_locks {
        // Lock names always carry a namespace, so the fallback is never used
        let fallback = config
            .namespaces
            .first()
            .map(String::as_str)
            .unwrap_or("default");
        Arc::new(LeaseLockService::new(client.clone(), identity, fallback))
    } else {
        Arc::new(InMemoryLockService::new())
    };
    info!(
        distributed_locks = config.distributed_locks,
        identity = %identity,
        worker_pool_size = config.worker_pool_size,
        "operator context built"
    );

    OperatorContext {
        config_maps: Arc::new(KubeConfigMapOperations::new(client.clone())),
        secrets: Arc::new(KubeSecretOperations::new(client.clone())),
        locks,
        cert_manager: Arc::new(RcgenCertManager::new()),
        operators: ResourceOperators::kube(client),
        pool: WorkerPool::new(config.worker_pool_size),
        lock_timeout: config.lock_timeout,
        selector: config.labels.clone(),
        images: config.images.clone(),
    }
}

/// One operator per enabled assembly type
pub fn operators(context: &OperatorContext, config: &OperatorConfig) -> Vec<Arc<AssemblyOperator>> {
    config
        .assembly_types()
        .into_iter()
        .map(|t| Arc::new(AssemblyOperator::for_type(context, t)))
        .collect()
}

/// Load configuration and build the operators against `client`
pub fn build(
    client: Client,
    env: &dyn EnvSource,
) -> Result<(OperatorConfig, Vec<Arc<AssemblyOperator>>)> {
    let config = OperatorConfig::from_env(env)?;
    let context = kube_context(client, &config, &holder_identity(env));
    let operators = operators(&context, &config);
    Ok((config, operators))
}
