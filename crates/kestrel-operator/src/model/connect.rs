//! Kafka Connect clusters
//!
//! Workers run as a Deployment `<c>-connect` behind a Service of the same
//! name. The S2I variant shares the configuration keys and the pod layout.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use serde_json::{json, Value};

use kestrel_common::{AssemblyType, Labels, Result};

use super::{
    config_identity, container_env, container_health, container_image, container_port, env_var,
    jvm_env, jvm_options_from_env, metrics_config_map, parse_properties, properties_text,
    service_port, to_dynamic, volume_mount, AssemblyModel, AssemblyModelBuilder, ConfigData,
    DesiredResource, HealthCheck, LiveWorkload, Storage, METRICS_PORT, METRICS_PORT_NAME,
};
use crate::config::DefaultImages;
use crate::resource::ResourceKind;

/// REST API port
pub const REST_API_PORT: i32 = 8083;

const REST_API_PORT_NAME: &str = "rest-api";
const CONTAINER_NAME: &str = "kafka-connect";
const METRICS_VOLUME_NAME: &str = "kafka-metrics-config";
const METRICS_MOUNT_PATH: &str = "/opt/prometheus/config/";
const ENV_CONFIGURATION: &str = "KAFKA_CONNECT_CONFIGURATION";
const ENV_METRICS_ENABLED: &str = "KAFKA_CONNECT_METRICS_ENABLED";
const JVM_ENV_PREFIX: &str = "KAFKA";

/// Configuration keys, shared with S2I
pub mod keys {
    /// Worker count
    pub const REPLICAS: &str = "nodes";
    /// Worker image
    pub const IMAGE: &str = "image";
    /// Probe initial delay (seconds)
    pub const HEALTHCHECK_DELAY: &str = "healthcheck-delay";
    /// Probe timeout (seconds)
    pub const HEALTHCHECK_TIMEOUT: &str = "healthcheck-timeout";
    /// Metrics exporter configuration (JSON)
    pub const METRICS_CONFIG: &str = "metrics-config";
    /// Worker settings (JSON object)
    pub const CONNECT_CONFIG: &str = "connect-config";
    /// JVM options (JSON)
    pub const JVM_OPTIONS: &str = "jvmOptions";
    /// Container resources (JSON)
    pub const RESOURCES: &str = "resources";
    /// Tag of the S2I source image
    pub const S2I_SOURCE_TAG: &str = "s2i-source-tag";
}

const DEFAULT_REPLICAS: i32 = 1;
pub(crate) const DEFAULT_HEALTH_CHECK: HealthCheck = HealthCheck {
    initial_delay: 60,
    timeout: 5,
};

const FORBIDDEN_CONFIG_PREFIXES: &[&str] = &[
    "ssl.",
    "sasl.",
    "security.",
    "listeners",
    "plugin.path",
    "rest.",
];

/// Name of the workload and Service
pub fn connect_name(cluster: &str) -> String {
    format!("{}-connect", cluster)
}

/// Name of the metrics ConfigMap
pub fn metrics_name(cluster: &str) -> String {
    format!("{}-connect-metrics-config", cluster)
}

/// Parse the keys shared by Connect and S2I
pub(crate) fn parse(
    config: &ConfigMap,
    assembly_type: AssemblyType,
    default_image: &str,
) -> Result<AssemblyModel> {
    let (cluster, namespace, labels) = config_identity(config)?;
    let data = ConfigData::new(&cluster, config);

    let source_image_tag = match assembly_type {
        AssemblyType::ConnectS2I => Some(data.string(keys::S2I_SOURCE_TAG, "latest")),
        _ => None,
    };

    Ok(AssemblyModel {
        assembly_type,
        replicas: data.count(keys::REPLICAS, DEFAULT_REPLICAS)?,
        image: data.string(keys::IMAGE, default_image),
        health_check: HealthCheck {
            initial_delay: data
                .count(keys::HEALTHCHECK_DELAY, DEFAULT_HEALTH_CHECK.initial_delay)?,
            timeout: data.count(keys::HEALTHCHECK_TIMEOUT, DEFAULT_HEALTH_CHECK.timeout)?,
        },
        storage: Storage::Ephemeral,
        resources: data.resources(keys::RESOURCES)?,
        jvm_options: data.jvm_options(keys::JVM_OPTIONS)?,
        rack: None,
        init_image: None,
        metrics_config: data.json(keys::METRICS_CONFIG)?,
        configuration: data.properties(keys::CONNECT_CONFIG, FORBIDDEN_CONFIG_PREFIXES)?,
        tls_enabled: false,
        source_image_tag,
        certificates: None,
        namespace,
        cluster,
        labels,
    })
}

/// Recover the shared fields from a live workload
pub(crate) fn parse_live(
    namespace: &str,
    cluster: &str,
    assembly_type: AssemblyType,
    workload: &DynamicObject,
) -> Result<AssemblyModel> {
    let live = LiveWorkload::new(workload);
    let container = live.container()?;
    let env = container_env(container);

    Ok(AssemblyModel {
        assembly_type,
        namespace: namespace.to_string(),
        cluster: cluster.to_string(),
        labels: live
            .labels()
            .with_cluster(cluster)
            .with_type(assembly_type)
            .without_name(),
        replicas: live.replicas(),
        image: container_image(container),
        health_check: container_health(container, DEFAULT_HEALTH_CHECK),
        storage: Storage::Ephemeral,
        resources: container.get("resources").cloned(),
        jvm_options: jvm_options_from_env(JVM_ENV_PREFIX, &env),
        rack: None,
        init_image: None,
        metrics_config: None,
        configuration: env
            .get(ENV_CONFIGURATION)
            .map(|c| parse_properties(c))
            .unwrap_or_default(),
        tls_enabled: false,
        source_image_tag: None,
        certificates: None,
    })
}

/// Pod selector
pub(crate) fn selector(model: &AssemblyModel) -> Labels {
    Labels::for_cluster(&model.cluster)
        .with_type(model.assembly_type)
        .with_name(&connect_name(&model.cluster))
}

/// The worker pod template, running `image`
pub(crate) fn pod_template(model: &AssemblyModel, image: &str) -> Value {
    let name = connect_name(&model.cluster);

    let mut env = vec![env_var(
        ENV_METRICS_ENABLED,
        model.metrics_enabled().to_string(),
    )];
    env.extend(jvm_env(JVM_ENV_PREFIX, model));
    if !model.configuration.is_empty() {
        env.push(env_var(
            ENV_CONFIGURATION,
            properties_text(&model.configuration),
        ));
    }

    let probe = json!({
        "httpGet": { "path": "/", "port": REST_API_PORT },
        "initialDelaySeconds": model.health_check.initial_delay,
        "timeoutSeconds": model.health_check.timeout,
    });

    let mut ports = vec![container_port(REST_API_PORT_NAME, REST_API_PORT)];
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if model.metrics_enabled() {
        ports.push(container_port(METRICS_PORT_NAME, METRICS_PORT));
        volumes.push(json!({
            "name": METRICS_VOLUME_NAME,
            "configMap": { "name": metrics_name(&model.cluster) },
        }));
        mounts.push(volume_mount(METRICS_VOLUME_NAME, METRICS_MOUNT_PATH));
    }

    let mut container = json!({
        "name": CONTAINER_NAME,
        "image": image,
        "ports": ports,
        "env": env,
        "volumeMounts": mounts,
        "livenessProbe": probe,
        "readinessProbe": probe,
    });
    if let Some(resources) = &model.resources {
        container["resources"] = resources.clone();
    }

    json!({
        "metadata": { "labels": model.labels_for(&name).to_map() },
        "spec": {
            "containers": [container],
            "volumes": volumes,
        },
    })
}

/// The REST API Service
pub(crate) fn service(model: &AssemblyModel) -> Result<DynamicObject> {
    let name = connect_name(&model.cluster);
    let mut ports = vec![service_port(REST_API_PORT_NAME, REST_API_PORT)];
    if model.metrics_enabled() {
        ports.push(service_port(METRICS_PORT_NAME, METRICS_PORT));
    }
    to_dynamic(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": model.metadata(&name),
        "spec": {
            "type": "ClusterIP",
            "selector": selector(model).to_map(),
            "ports": ports,
        },
    }))
}

/// Builds Kafka Connect cluster resources
pub struct ConnectModelBuilder {
    images: DefaultImages,
}

impl ConnectModelBuilder {
    /// Builder using `images` when the configuration names none
    pub fn new(images: DefaultImages) -> Self {
        Self { images }
    }

    fn deployment(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = connect_name(&model.cluster);
        to_dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": model.metadata(&name),
            "spec": {
                "replicas": model.replicas,
                "selector": { "matchLabels": selector(model).to_map() },
                "strategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": { "maxSurge": 1, "maxUnavailable": 0 },
                },
                "template": pod_template(model, &model.image),
            },
        }))
    }
}

impl AssemblyModelBuilder for ConnectModelBuilder {
    fn assembly_type(&self) -> AssemblyType {
        AssemblyType::Connect
    }

    fn workload(&self, cluster: &str) -> (ResourceKind, String) {
        (ResourceKind::Deployment, connect_name(cluster))
    }

    fn from_config(&self, config: &ConfigMap) -> Result<AssemblyModel> {
        parse(config, AssemblyType::Connect, &self.images.connect)
    }

    fn from_live_resource(
        &self,
        namespace: &str,
        cluster: &str,
        workload: &DynamicObject,
    ) -> Result<AssemblyModel> {
        parse_live(namespace, cluster, AssemblyType::Connect, workload)
    }

    fn generate_desired(&self, model: &AssemblyModel) -> Result<Vec<DesiredResource>> {
        let name = connect_name(&model.cluster);
        Ok(vec![
            DesiredResource::present(ResourceKind::Service, &name, service(model)?),
            metrics_config_map(model, &metrics_name(&model.cluster))?,
            DesiredResource::present(ResourceKind::Deployment, &name, self.deployment(model)?),
        ])
    }

    fn managed_resources(&self, cluster: &str) -> Vec<(ResourceKind, String)> {
        vec![
            (ResourceKind::Service, connect_name(cluster)),
            (ResourceKind::ConfigMap, metrics_name(cluster)),
            (ResourceKind::Deployment, connect_name(cluster)),
        ]
    }
}
