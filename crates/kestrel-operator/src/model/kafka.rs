//! Kafka broker clusters
//!
//! A cluster `c` is realized as a StatefulSet `c-kafka`, a client Service, a
//! headless Service for broker-to-broker traffic, an optional metrics
//! ConfigMap and, with TLS on, three credential Secrets.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use serde_json::{json, Value};

use kestrel_common::{AssemblyType, Error, Labels, Result};
use kestrel_pki::{CredentialBundle, TrustDomain};

use super::{
    bundle_secret, config_identity, container_env, container_health, container_image,
    container_port, env_var, exec_probe, jvm_env, jvm_options_from_env, metrics_config_map,
    parse_properties, properties_text, service_port, to_dynamic, volume_mount, AssemblyModel,
    AssemblyModelBuilder, ConfigData, DesiredResource, HealthCheck, LiveWorkload, Rack, Storage,
    DATA_VOLUME_NAME, DELETE_CLAIM_ANNOTATION, METRICS_PORT, METRICS_PORT_NAME,
};
use crate::config::DefaultImages;
use crate::resource::ResourceKind;

/// Client listener port
pub const CLIENT_PORT: i32 = 9092;
/// Replication listener port
pub const REPLICATION_PORT: i32 = 9091;

const CLIENT_PORT_NAME: &str = "clients";
const REPLICATION_PORT_NAME: &str = "replication";
const CONTAINER_NAME: &str = "kafka";
const INIT_CONTAINER_NAME: &str = "init-kafka";
const HEALTH_CHECK_PATH: &str = "/opt/kafka/kafka_healthcheck.sh";
const DATA_MOUNT_PATH: &str = "/var/lib/kafka";
const METRICS_VOLUME_NAME: &str = "kafka-metrics-config";
const METRICS_MOUNT_PATH: &str = "/opt/prometheus/config/";
const RACK_VOLUME_NAME: &str = "rack-volume";
const RACK_MOUNT_PATH: &str = "/opt/kafka/rack";
const INTERNAL_CERTS_VOLUME: &str = "internal-certs";
const INTERNAL_CERTS_PATH: &str = "/var/lib/kafka/internal-certs";
const CLIENTS_CERTS_VOLUME: &str = "clients-certs";
const CLIENTS_CERTS_PATH: &str = "/var/lib/kafka/clients-certs";
const TOLERATE_UNREADY_ANNOTATION: &str = "service.alpha.kubernetes.io/tolerate-unready-endpoints";

const ENV_ZOOKEEPER_CONNECT: &str = "KAFKA_ZOOKEEPER_CONNECT";
const ENV_METRICS_ENABLED: &str = "KAFKA_METRICS_ENABLED";
const ENV_CONFIGURATION: &str = "KAFKA_CONFIGURATION";
const ENV_NODE_NAME: &str = "NODE_NAME";
const ENV_RACK_TOPOLOGY_KEY: &str = "RACK_TOPOLOGY_KEY";
const JVM_ENV_PREFIX: &str = "KAFKA";

/// Configuration keys
pub mod keys {
    /// Broker count
    pub const REPLICAS: &str = "kafka-nodes";
    /// Broker image
    pub const IMAGE: &str = "kafka-image";
    /// Probe initial delay (seconds)
    pub const HEALTHCHECK_DELAY: &str = "kafka-healthcheck-delay";
    /// Probe timeout (seconds)
    pub const HEALTHCHECK_TIMEOUT: &str = "kafka-healthcheck-timeout";
    /// Metrics exporter configuration (JSON)
    pub const METRICS_CONFIG: &str = "kafka-metrics-config";
    /// Storage (JSON)
    pub const STORAGE: &str = "kafka-storage";
    /// Broker settings (JSON object)
    pub const KAFKA_CONFIG: &str = "kafka-config";
    /// JVM options (JSON)
    pub const JVM_OPTIONS: &str = "kafka-jvmOptions";
    /// Container resources (JSON)
    pub const RESOURCES: &str = "kafka-resources";
    /// Rack awareness (JSON)
    pub const RACK: &str = "kafka-rack";
    /// Init container image
    pub const INIT_IMAGE: &str = "init-kafka-image";
    /// Member TLS certificates
    pub const TLS: &str = "kafka-tls";
}

const DEFAULT_REPLICAS: i32 = 3;
const DEFAULT_HEALTH_CHECK: HealthCheck = HealthCheck {
    initial_delay: 15,
    timeout: 5,
};

/// Broker settings the operator owns
const FORBIDDEN_CONFIG_PREFIXES: &[&str] = &[
    "listeners",
    "advertised.",
    "broker.",
    "listener.",
    "host.name",
    "port",
    "inter.broker.listener.name",
    "sasl.",
    "ssl.",
    "security.",
    "password.",
    "principal.builder.class",
    "log.dir",
    "zookeeper.connect",
    "zookeeper.set.acl",
    "authorizer.",
    "super.user",
];

/// Name of the StatefulSet and client Service
pub fn kafka_name(cluster: &str) -> String {
    format!("{}-kafka", cluster)
}

/// Name of the headless Service
pub fn headless_name(cluster: &str) -> String {
    format!("{}-kafka-headless", cluster)
}

/// Name of the metrics ConfigMap
pub fn metrics_name(cluster: &str) -> String {
    format!("{}-kafka-metrics-config", cluster)
}

/// Name of broker `index`
pub fn pod_name(cluster: &str, index: i32) -> String {
    format!("{}-kafka-{}", cluster, index)
}

/// Name of the data claim of broker `index`
pub fn claim_name(cluster: &str, index: i32) -> String {
    format!("{}-{}", DATA_VOLUME_NAME, pod_name(cluster, index))
}

/// Secret exposing the clients authority certificate
pub fn clients_ca_cert_name(cluster: &str) -> String {
    format!("{}-kafka-clients-ca-cert", cluster)
}

/// Secret with the internal-domain broker certificates
pub fn brokers_internal_name(cluster: &str) -> String {
    format!("{}-kafka-brokers-internal", cluster)
}

/// Secret with the clients-domain broker certificates
pub fn brokers_clients_name(cluster: &str) -> String {
    format!("{}-kafka-brokers-clients", cluster)
}

fn zookeeper_connect(cluster: &str) -> String {
    format!("{}-zookeeper:2181", cluster)
}

/// Builds Kafka cluster resources
pub struct KafkaModelBuilder {
    images: DefaultImages,
}

impl KafkaModelBuilder {
    /// Builder using `images` when the configuration names none
    pub fn new(images: DefaultImages) -> Self {
        Self { images }
    }

    fn client_service(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = kafka_name(&model.cluster);
        let mut ports = vec![service_port(CLIENT_PORT_NAME, CLIENT_PORT)];
        if model.metrics_enabled() {
            ports.push(service_port(METRICS_PORT_NAME, METRICS_PORT));
        }
        to_dynamic(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": model.metadata(&name),
            "spec": {
                "type": "ClusterIP",
                "selector": self.selector(model).to_map(),
                "ports": ports,
            },
        }))
    }

    fn headless_service(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = headless_name(&model.cluster);
        let mut metadata = model.metadata(&name);
        metadata["annotations"] = json!({ TOLERATE_UNREADY_ANNOTATION: "true" });
        to_dynamic(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata,
            "spec": {
                "type": "ClusterIP",
                "clusterIP": "None",
                "selector": self.selector(model).to_map(),
                "ports": [
                    service_port(CLIENT_PORT_NAME, CLIENT_PORT),
                    service_port(REPLICATION_PORT_NAME, REPLICATION_PORT),
                ],
            },
        }))
    }

    /// Pod selector: the workload's own labels
    fn selector(&self, model: &AssemblyModel) -> Labels {
        Labels::for_cluster(&model.cluster)
            .with_type(AssemblyType::Kafka)
            .with_name(&kafka_name(&model.cluster))
    }

    fn env(&self, model: &AssemblyModel) -> Vec<Value> {
        let mut env = vec![
            env_var(ENV_ZOOKEEPER_CONNECT, zookeeper_connect(&model.cluster)),
            env_var(ENV_METRICS_ENABLED, model.metrics_enabled().to_string()),
        ];
        env.extend(jvm_env(JVM_ENV_PREFIX, model));
        if !model.configuration.is_empty() {
            env.push(env_var(
                ENV_CONFIGURATION,
                properties_text(&model.configuration),
            ));
        }
        env
    }

    fn stateful_set(&self, model: &AssemblyModel) -> Result<DynamicObject> {
        let name = kafka_name(&model.cluster);
        let selector = self.selector(model);

        let mut ports = vec![
            container_port(CLIENT_PORT_NAME, CLIENT_PORT),
            container_port(REPLICATION_PORT_NAME, REPLICATION_PORT),
        ];
        let mut volumes = Vec::new();
        let mut mounts = vec![volume_mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH)];

        if model.storage == Storage::Ephemeral {
            volumes.push(json!({ "name": DATA_VOLUME_NAME, "emptyDir": {} }));
        }
        if model.metrics_enabled() {
            ports.push(container_port(METRICS_PORT_NAME, METRICS_PORT));
            volumes.push(json!({
                "name": METRICS_VOLUME_NAME,
                "configMap": { "name": metrics_name(&model.cluster) },
            }));
            mounts.push(volume_mount(METRICS_VOLUME_NAME, METRICS_MOUNT_PATH));
        }
        if model.rack.is_some() {
            volumes.push(json!({ "name": RACK_VOLUME_NAME, "emptyDir": {} }));
            mounts.push(volume_mount(RACK_VOLUME_NAME, RACK_MOUNT_PATH));
        }
        if model.tls_enabled {
            volumes.push(json!({
                "name": INTERNAL_CERTS_VOLUME,
                "secret": { "secretName": brokers_internal_name(&model.cluster) },
            }));
            volumes.push(json!({
                "name": CLIENTS_CERTS_VOLUME,
                "secret": { "secretName": brokers_clients_name(&model.cluster) },
            }));
            mounts.push(volume_mount(INTERNAL_CERTS_VOLUME, INTERNAL_CERTS_PATH));
            mounts.push(volume_mount(CLIENTS_CERTS_VOLUME, CLIENTS_CERTS_PATH));
        }

        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": model.image,
            "ports": ports,
            "env": self.env(model),
            "volumeMounts": mounts,
            "livenessProbe": exec_probe(HEALTH_CHECK_PATH, model.health_check),
            "readinessProbe": exec_probe(HEALTH_CHECK_PATH, model.health_check),
        });
        if let Some(resources) = &model.resources {
            container["resources"] = resources.clone();
        }

        let mut pod_spec = json!({
            "containers": [container],
            "volumes": volumes,
        });
        if let Some(rack) = &model.rack {
            pod_spec["initContainers"] = json!([self.init_container(model, rack)]);
            pod_spec["affinity"] = json!({
                "podAntiAffinity": {
                    "preferredDuringSchedulingIgnoredDuringExecution": [{
                        "weight": 100,
                        "podAffinityTerm": {
                            "labelSelector": { "matchLabels": selector.to_map() },
                            "topologyKey": rack.topology_key,
                        },
                    }],
                },
            });
        }

        let mut metadata = model.metadata(&name);
        metadata["annotations"] = json!({
            DELETE_CLAIM_ANNOTATION: model.storage.delete_claim().to_string(),
        });

        let mut spec = json!({
            "replicas": model.replicas,
            "serviceName": headless_name(&model.cluster),
            "podManagementPolicy": "Parallel",
            "selector": { "matchLabels": selector.to_map() },
            "template": {
                "metadata": { "labels": model.labels_for(&name).to_map() },
                "spec": pod_spec,
            },
        });
        if let Storage::PersistentClaim { size, class, .. } = &model.storage {
            let mut claim_spec = json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": size } },
            });
            if let Some(class) = class {
                claim_spec["storageClassName"] = json!(class);
            }
            spec["volumeClaimTemplates"] = json!([{
                "metadata": {
                    "name": DATA_VOLUME_NAME,
                    "labels": model.labels_for(&name).to_map(),
                },
                "spec": claim_spec,
            }]);
        }

        to_dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": metadata,
            "spec": spec,
        }))
    }

    fn init_container(&self, model: &AssemblyModel, rack: &Rack) -> Value {
        json!({
            "name": INIT_CONTAINER_NAME,
            "image": model.init_image.clone().unwrap_or_else(|| self.images.init_kafka.clone()),
            "env": [
                {
                    "name": ENV_NODE_NAME,
                    "valueFrom": { "fieldRef": { "fieldPath": "spec.nodeName" } },
                },
                env_var(ENV_RACK_TOPOLOGY_KEY, rack.topology_key.clone()),
            ],
            "volumeMounts": [volume_mount(RACK_VOLUME_NAME, RACK_MOUNT_PATH)],
            "resources": {
                "requests": { "cpu": "100m", "memory": "128Mi" },
                "limits": { "cpu": "1", "memory": "256Mi" },
            },
        })
    }

    fn secrets(&self, model: &AssemblyModel) -> Result<Vec<DesiredResource>> {
        let cluster = &model.cluster;
        let names = [
            clients_ca_cert_name(cluster),
            brokers_internal_name(cluster),
            brokers_clients_name(cluster),
        ];
        if !model.tls_enabled {
            return Ok(names
                .into_iter()
                .map(|n| DesiredResource::absent(ResourceKind::Secret, n))
                .collect());
        }
        let certs = model.certificates.as_ref().ok_or_else(|| {
            Error::internal_with_context("kafka", format!("{}: certificates not issued", cluster))
        })?;
        let [clients_ca, internal, clients] = names;
        Ok(vec![
            bundle_secret(
                model,
                &clients_ca,
                CredentialBundle::trust(TrustDomain::Clients, &certs.clients.ca_cert_pem),
            )?,
            bundle_secret(
                model,
                &internal,
                CredentialBundle::members(TrustDomain::Internal, &certs.internal),
            )?,
            bundle_secret(
                model,
                &clients,
                CredentialBundle::members(TrustDomain::Clients, &certs.clients)
                    .with_trust(TrustDomain::Internal, &certs.internal.ca_cert_pem),
            )?,
        ])
    }
}

impl AssemblyModelBuilder for KafkaModelBuilder {
    fn assembly_type(&self) -> AssemblyType {
        AssemblyType::Kafka
    }

    fn workload(&self, cluster: &str) -> (ResourceKind, String) {
        (ResourceKind::StatefulSet, kafka_name(cluster))
    }

    fn from_config(&self, config: &ConfigMap) -> Result<AssemblyModel> {
        let (cluster, namespace, labels) = config_identity(config)?;
        let data = ConfigData::new(&cluster, config);

        let model = AssemblyModel {
            assembly_type: AssemblyType::Kafka,
            replicas: data.count(keys::REPLICAS, DEFAULT_REPLICAS)?,
            image: data.string(keys::IMAGE, &self.images.kafka),
            health_check: HealthCheck {
                initial_delay: data
                    .count(keys::HEALTHCHECK_DELAY, DEFAULT_HEALTH_CHECK.initial_delay)?,
                timeout: data.count(keys::HEALTHCHECK_TIMEOUT, DEFAULT_HEALTH_CHECK.timeout)?,
            },
            storage: data.storage(keys::STORAGE)?,
            resources: data.resources(keys::RESOURCES)?,
            jvm_options: data.jvm_options(keys::JVM_OPTIONS)?,
            rack: data.rack(keys::RACK)?,
            init_image: Some(data.string(keys::INIT_IMAGE, &self.images.init_kafka)),
            metrics_config: data.json(keys::METRICS_CONFIG)?,
            configuration: data.properties(keys::KAFKA_CONFIG, FORBIDDEN_CONFIG_PREFIXES)?,
            tls_enabled: data.boolean(keys::TLS, true)?,
            source_image_tag: None,
            certificates: None,
            namespace,
            cluster,
            labels,
        };
        Ok(model)
    }

    fn from_live_resource(
        &self,
        namespace: &str,
        cluster: &str,
        workload: &DynamicObject,
    ) -> Result<AssemblyModel> {
        let live = LiveWorkload::new(workload);
        let container = live.container()?;
        let env = container_env(container);

        let storage = match live.value("/spec/volumeClaimTemplates/0/spec") {
            Some(claim) => Storage::PersistentClaim {
                size: claim
                    .pointer("/resources/requests/storage")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                class: claim
                    .get("storageClassName")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                delete_claim: live.annotation(DELETE_CLAIM_ANNOTATION) == Some("true"),
            },
            None => Storage::Ephemeral,
        };

        let rack = live
            .value("/spec/template/spec/affinity/podAntiAffinity/preferredDuringSchedulingIgnoredDuringExecution/0/podAffinityTerm/topologyKey")
            .and_then(Value::as_str)
            .map(|k| Rack {
                topology_key: k.to_string(),
            });

        Ok(AssemblyModel {
            assembly_type: AssemblyType::Kafka,
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            labels: live
                .labels()
                .with_cluster(cluster)
                .with_type(AssemblyType::Kafka)
                .without_name(),
            replicas: live.replicas(),
            image: container_image(container),
            health_check: container_health(container, DEFAULT_HEALTH_CHECK),
            storage,
            resources: container.get("resources").cloned(),
            jvm_options: jvm_options_from_env(JVM_ENV_PREFIX, &env),
            rack,
            init_image: live
                .init_container(INIT_CONTAINER_NAME)
                .map(container_image),
            metrics_config: None,
            configuration: env
                .get(ENV_CONFIGURATION)
                .map(|c| parse_properties(c))
                .unwrap_or_else(BTreeMap::new),
            tls_enabled: live
                .value("/spec/template/spec/volumes")
                .and_then(Value::as_array)
                .is_some_and(|vols| {
                    vols.iter()
                        .any(|v| v.get("name").and_then(Value::as_str) == Some(INTERNAL_CERTS_VOLUME))
                }),
            source_image_tag: None,
            certificates: None,
        })
    }

    fn member_names(&self, model: &AssemblyModel) -> Vec<String> {
        if !model.tls_enabled {
            return Vec::new();
        }
        (0..model.replicas)
            .map(|i| pod_name(&model.cluster, i))
            .collect()
    }

    fn member_bundle_name(&self, cluster: &str, domain: TrustDomain) -> Option<String> {
        Some(match domain {
            TrustDomain::Internal => brokers_internal_name(cluster),
            TrustDomain::Clients => brokers_clients_name(cluster),
        })
    }

    fn generate_desired(&self, model: &AssemblyModel) -> Result<Vec<DesiredResource>> {
        let cluster = &model.cluster;
        let mut desired = vec![
            DesiredResource::present(
                ResourceKind::Service,
                kafka_name(cluster),
                self.client_service(model)?,
            ),
            DesiredResource::present(
                ResourceKind::Service,
                headless_name(cluster),
                self.headless_service(model)?,
            ),
            metrics_config_map(model, &metrics_name(cluster))?,
        ];
        desired.extend(self.secrets(model)?);
        desired.push(DesiredResource::present(
            ResourceKind::StatefulSet,
            kafka_name(cluster),
            self.stateful_set(model)?,
        ));
        Ok(desired)
    }

    fn managed_resources(&self, cluster: &str) -> Vec<(ResourceKind, String)> {
        vec![
            (ResourceKind::Service, kafka_name(cluster)),
            (ResourceKind::Service, headless_name(cluster)),
            (ResourceKind::ConfigMap, metrics_name(cluster)),
            (ResourceKind::Secret, clients_ca_cert_name(cluster)),
            (ResourceKind::Secret, brokers_internal_name(cluster)),
            (ResourceKind::Secret, brokers_clients_name(cluster)),
            (ResourceKind::StatefulSet, kafka_name(cluster)),
        ]
    }

    fn claims_to_delete(&self, model: &AssemblyModel) -> Vec<String> {
        if !model.storage.delete_claim() {
            return Vec::new();
        }
        (0..model.replicas)
            .map(|i| claim_name(&model.cluster, i))
            .collect()
    }
}
