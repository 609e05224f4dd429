//! Assembly models: the desired state of one cluster
//!
//! A model is built fresh on every pass, either from the cluster's
//! configuration ConfigMap or, when that is gone, reverse-engineered from the
//! live workload. Builders turn a model into the concrete resources it needs.
//! They are pure: no I/O, no key generation.

pub mod connect;
pub mod connect_s2i;
pub mod kafka;

pub use connect::ConnectModelBuilder;
pub use connect_s2i::ConnectS2IModelBuilder;
pub use kafka::KafkaModelBuilder;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

use kestrel_common::{AssemblyType, Error, Labels, Result};
use kestrel_pki::{CredentialBundle, MemberCertificates, TrustDomain};

use crate::resource::ResourceKind;

/// Key of the metrics configuration inside the metrics ConfigMap
pub const METRICS_CONFIG_FILE: &str = "config.yml";
/// Name of the metrics port
pub const METRICS_PORT_NAME: &str = "kafkametrics";
/// Metrics port
pub const METRICS_PORT: i32 = 9404;
/// Annotation carrying the delete-claim flag on workloads
pub const DELETE_CLAIM_ANNOTATION: &str = "kestrel.io/delete-claim";
/// Name of the data volume
pub const DATA_VOLUME_NAME: &str = "data";

/// Readiness and liveness probe timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    /// Seconds before the first probe
    pub initial_delay: i32,
    /// Probe timeout in seconds
    pub timeout: i32,
}

/// Where members keep their data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Storage {
    /// Pod-local emptyDir, lost with the pod
    Ephemeral,
    /// One PersistentVolumeClaim per member
    PersistentClaim {
        /// Requested size (e.g. "100Gi")
        size: String,
        /// StorageClass; cluster default when unset
        class: Option<String>,
        /// Delete the claims when the cluster is deleted
        delete_claim: bool,
    },
}

impl Storage {
    /// Parse `{"type":"ephemeral"}` or
    /// `{"type":"persistent-claim","size":..,"class":..,"delete-claim":bool}`
    fn from_json(cluster: &str, key: &str, value: &Value) -> Result<Self> {
        let invalid = |msg: &str| Error::invalid_configuration_for_field(cluster, key, msg);
        match value.get("type").and_then(Value::as_str) {
            Some("ephemeral") => Ok(Self::Ephemeral),
            Some("persistent-claim") => {
                let size = value
                    .get("size")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| invalid("persistent-claim storage needs a size"))?;
                let delete_claim = match value.get("delete-claim") {
                    None => false,
                    Some(v) => v
                        .as_bool()
                        .ok_or_else(|| invalid("delete-claim must be a boolean"))?,
                };
                Ok(Self::PersistentClaim {
                    size: size.to_string(),
                    class: value
                        .get("class")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    delete_claim,
                })
            }
            Some(other) => Err(invalid(&format!("unknown storage type '{}'", other))),
            None => Err(invalid("storage type is missing")),
        }
    }

    /// Whether claims are deleted with the cluster
    pub fn delete_claim(&self) -> bool {
        matches!(
            self,
            Self::PersistentClaim {
                delete_claim: true,
                ..
            }
        )
    }
}

/// JVM tuning
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JvmOptions {
    /// Maximum heap (-Xmx)
    pub xmx: Option<String>,
    /// Initial heap (-Xms)
    pub xms: Option<String>,
    /// Run with -server
    pub server: bool,
}

impl JvmOptions {
    fn from_json(cluster: &str, key: &str, value: &Value) -> Result<Self> {
        let invalid = |msg: &str| Error::invalid_configuration_for_field(cluster, key, msg);
        let text = |field: &str| -> Result<Option<String>> {
            match value.get(field) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(invalid(&format!("{} must be a string", field))),
            }
        };
        Ok(Self {
            xmx: text("-Xmx")?,
            xms: text("-Xms")?,
            server: match value.get("-server") {
                None => false,
                Some(v) => v
                    .as_bool()
                    .ok_or_else(|| invalid("-server must be a boolean"))?,
            },
        })
    }
}

/// Spread members across failure domains
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rack {
    /// Node label identifying the failure domain
    pub topology_key: String,
}

/// The member certificates of one cluster, both trust domains
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterCertificates {
    /// Leaves signed by the internal authority
    pub internal: MemberCertificates,
    /// Leaves signed by the clients authority
    pub clients: MemberCertificates,
}

impl ClusterCertificates {
    /// Leaves of one domain
    pub fn domain(&self, domain: TrustDomain) -> &MemberCertificates {
        match domain {
            TrustDomain::Internal => &self.internal,
            TrustDomain::Clients => &self.clients,
        }
    }
}

/// Desired state of one cluster
#[derive(Clone, Debug, PartialEq)]
pub struct AssemblyModel {
    /// Assembly type
    pub assembly_type: AssemblyType,
    /// Namespace
    pub namespace: String,
    /// Cluster name
    pub cluster: String,
    /// Labels every generated resource carries (plus its own name label)
    pub labels: Labels,
    /// Member count
    pub replicas: i32,
    /// Container image
    pub image: String,
    /// Probe timing
    pub health_check: HealthCheck,
    /// Data storage
    pub storage: Storage,
    /// Container resource requirements, as given
    pub resources: Option<Value>,
    /// JVM tuning
    pub jvm_options: Option<JvmOptions>,
    /// Rack awareness
    pub rack: Option<Rack>,
    /// Image of the rack-awareness init container
    pub init_image: Option<String>,
    /// Metrics exporter configuration; metrics are enabled iff set
    pub metrics_config: Option<Value>,
    /// Application configuration (broker or worker properties)
    pub configuration: BTreeMap<String, String>,
    /// Whether members get TLS certificates
    pub tls_enabled: bool,
    /// Tag of the S2I source image
    pub source_image_tag: Option<String>,
    /// Member certificates, once issued
    pub certificates: Option<ClusterCertificates>,
}

impl AssemblyModel {
    /// Return a copy carrying `certificates`
    pub fn with_certificates(self, certificates: ClusterCertificates) -> Self {
        Self {
            certificates: Some(certificates),
            ..self
        }
    }

    /// Whether metrics are enabled
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_config.is_some()
    }

    /// Labels of the resource called `name`
    pub fn labels_for(&self, name: &str) -> Labels {
        self.labels.with_name(name)
    }

    /// Metadata for the resource called `name`
    pub(crate) fn metadata(&self, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.namespace,
            "labels": self.labels_for(name).to_map(),
        })
    }
}

/// One resource the model wants, or wants gone
#[derive(Clone, Debug)]
pub struct DesiredResource {
    /// Kind
    pub kind: ResourceKind,
    /// Name
    pub name: String,
    /// Desired object; `None` means the resource must not exist
    pub object: Option<DynamicObject>,
}

impl DesiredResource {
    /// A resource that should exist
    pub fn present(kind: ResourceKind, name: impl Into<String>, object: DynamicObject) -> Self {
        Self {
            kind,
            name: name.into(),
            object: Some(object),
        }
    }

    /// A resource that should not exist
    pub fn absent(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            object: None,
        }
    }
}

/// Translates configuration into resources for one assembly type
pub trait AssemblyModelBuilder: Send + Sync {
    /// Assembly type handled
    fn assembly_type(&self) -> AssemblyType;

    /// Kind and name of the cluster's workload
    fn workload(&self, cluster: &str) -> (ResourceKind, String);

    /// Build the desired model from a configuration resource
    fn from_config(&self, config: &ConfigMap) -> Result<AssemblyModel>;

    /// Best-effort model recovered from a live workload
    fn from_live_resource(
        &self,
        namespace: &str,
        cluster: &str,
        workload: &DynamicObject,
    ) -> Result<AssemblyModel>;

    /// Names of the members that get certificates; empty if the type has no TLS
    fn member_names(&self, _model: &AssemblyModel) -> Vec<String> {
        Vec::new()
    }

    /// Secret holding the member bundle of `domain`, if the type has one
    fn member_bundle_name(&self, _cluster: &str, _domain: TrustDomain) -> Option<String> {
        None
    }

    /// Every resource the model implies, in apply order
    fn generate_desired(&self, model: &AssemblyModel) -> Result<Vec<DesiredResource>>;

    /// Every resource the type may create for `cluster`, for deletion
    ///
    /// The workload comes last: while it exists the cluster is still found
    /// by a batch, so an interrupted deletion is picked up again.
    fn managed_resources(&self, cluster: &str) -> Vec<(ResourceKind, String)>;

    /// Claims to delete along with the cluster
    fn claims_to_delete(&self, _model: &AssemblyModel) -> Vec<String> {
        Vec::new()
    }
}

// =============================================================================
// Configuration parsing
// =============================================================================

/// Typed access to a configuration ConfigMap's data
pub(crate) struct ConfigData<'a> {
    cluster: &'a str,
    data: BTreeMap<String, String>,
}

impl<'a> ConfigData<'a> {
    pub(crate) fn new(cluster: &'a str, config: &ConfigMap) -> Self {
        Self {
            cluster,
            data: config.data.clone().unwrap_or_default(),
        }
    }

    fn invalid(&self, key: &str, msg: String) -> Error {
        Error::invalid_configuration_for_field(self.cluster, key, msg)
    }

    /// Non-empty string, or `default`
    pub(crate) fn string(&self, key: &str, default: &str) -> String {
        self.data
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    /// Non-negative integer, or `default`
    pub(crate) fn count(&self, key: &str, default: i32) -> Result<i32> {
        match self.data.get(key).map(|s| s.trim()) {
            None | Some("") => Ok(default),
            Some(s) => match s.parse::<i32>() {
                Ok(n) if n >= 0 => Ok(n),
                Ok(n) => Err(self.invalid(key, format!("{} must not be negative", n))),
                Err(_) => Err(self.invalid(key, format!("'{}' is not an integer", s))),
            },
        }
    }

    /// Boolean, or `default`
    pub(crate) fn boolean(&self, key: &str, default: bool) -> Result<bool> {
        match self.data.get(key).map(|s| s.trim()) {
            None | Some("") => Ok(default),
            Some(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Some(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            Some(s) => Err(self.invalid(key, format!("'{}' is not a boolean", s))),
        }
    }

    /// Parsed JSON, if the key is set
    pub(crate) fn json(&self, key: &str) -> Result<Option<Value>> {
        match self.data.get(key).map(|s| s.trim()) {
            None | Some("") => Ok(None),
            Some(s) => serde_json::from_str(s)
                .map(Some)
                .map_err(|e| self.invalid(key, format!("invalid JSON: {}", e))),
        }
    }

    /// JSON object, if the key is set
    pub(crate) fn json_object(&self, key: &str) -> Result<Option<Map<String, Value>>> {
        match self.json(key)? {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(self.invalid(key, "expected a JSON object".to_string())),
        }
    }

    pub(crate) fn storage(&self, key: &str) -> Result<Storage> {
        match self.json(key)? {
            None => Ok(Storage::Ephemeral),
            Some(v) => Storage::from_json(self.cluster, key, &v),
        }
    }

    pub(crate) fn jvm_options(&self, key: &str) -> Result<Option<JvmOptions>> {
        self.json_object(key)?
            .map(|m| JvmOptions::from_json(self.cluster, key, &Value::Object(m)))
            .transpose()
    }

    pub(crate) fn resources(&self, key: &str) -> Result<Option<Value>> {
        let Some(map) = self.json_object(key)? else {
            return Ok(None);
        };
        for (section, value) in &map {
            if section != "limits" && section != "requests" {
                return Err(self.invalid(key, format!("unknown section '{}'", section)));
            }
            if !value.is_object() {
                return Err(self.invalid(key, format!("{} must be an object", section)));
            }
        }
        Ok(Some(Value::Object(map)))
    }

    pub(crate) fn rack(&self, key: &str) -> Result<Option<Rack>> {
        let Some(map) = self.json_object(key)? else {
            return Ok(None);
        };
        map.get("topologyKey")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|k| {
                Some(Rack {
                    topology_key: k.to_string(),
                })
            })
            .ok_or_else(|| self.invalid(key, "topologyKey is required".to_string()))
    }

    /// Flat string properties from a JSON object, minus `forbidden` prefixes
    pub(crate) fn properties(
        &self,
        key: &str,
        forbidden: &[&str],
    ) -> Result<BTreeMap<String, String>> {
        let Some(map) = self.json_object(key)? else {
            return Ok(BTreeMap::new());
        };
        let mut properties = BTreeMap::new();
        for (name, value) in map {
            if forbidden.iter().any(|p| name.starts_with(p)) {
                continue;
            }
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(self.invalid(
                        key,
                        format!("value of '{}' must be a string, number or boolean", name),
                    ))
                }
            };
            properties.insert(name, text);
        }
        Ok(properties)
    }
}

/// Cluster name and generated-resource labels of a configuration ConfigMap
pub(crate) fn config_identity(config: &ConfigMap) -> Result<(String, String, Labels)> {
    let name = config
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::invalid_configuration("unknown", "configuration has no name"))?;
    let namespace = config.metadata.namespace.clone().unwrap_or_default();
    let labels = Labels::from_resource(&config.metadata)
        .without_kind()
        .with_cluster(&name);
    Ok((name, namespace, labels))
}

/// Render properties as `key=value` lines
pub(crate) fn properties_text(properties: &BTreeMap<String, String>) -> String {
    properties
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
}

/// Parse `key=value` lines
pub(crate) fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

// =============================================================================
// Resource construction
// =============================================================================

/// Convert a manifest into a dynamic object
pub(crate) fn to_dynamic(value: Value) -> Result<DynamicObject> {
    serde_json::from_value(value).map_err(|e| Error::internal_with_context("model", e.to_string()))
}

/// Convert a typed object into a dynamic object
pub(crate) fn typed_to_dynamic<T: serde::Serialize>(obj: &T) -> Result<DynamicObject> {
    serde_json::to_value(obj)
        .map_err(|e| Error::internal_with_context("model", e.to_string()))
        .and_then(to_dynamic)
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> Value {
    json!({ "name": name, "value": value.into() })
}

pub(crate) fn exec_probe(command: &str, health: HealthCheck) -> Value {
    json!({
        "exec": { "command": [command] },
        "initialDelaySeconds": health.initial_delay,
        "timeoutSeconds": health.timeout,
    })
}

pub(crate) fn container_port(name: &str, port: i32) -> Value {
    json!({ "name": name, "containerPort": port, "protocol": "TCP" })
}

pub(crate) fn service_port(name: &str, port: i32) -> Value {
    json!({ "name": name, "port": port, "targetPort": port, "protocol": "TCP" })
}

pub(crate) fn volume_mount(name: &str, path: &str) -> Value {
    json!({ "name": name, "mountPath": path })
}

/// Heap and JVM performance environment
pub(crate) fn jvm_env(prefix: &str, model: &AssemblyModel) -> Vec<Value> {
    let mut env = Vec::new();
    let jvm = model.jvm_options.clone().unwrap_or_default();

    let mut heap = Vec::new();
    if let Some(xms) = &jvm.xms {
        heap.push(format!("-Xms{}", xms));
    }
    if let Some(xmx) = &jvm.xmx {
        heap.push(format!("-Xmx{}", xmx));
    }
    if !heap.is_empty() {
        env.push(env_var(&format!("{}_HEAP_OPTS", prefix), heap.join(" ")));
    } else if model
        .resources
        .as_ref()
        .and_then(|r| r.pointer("/limits/memory"))
        .is_some()
    {
        // Let the container entrypoint size the heap from the memory limit
        env.push(env_var("DYNAMIC_HEAP_FRACTION", "0.5"));
        env.push(env_var("DYNAMIC_HEAP_MAX", (5u64 << 30).to_string()));
    }
    if jvm.server {
        env.push(env_var(&format!("{}_JVM_PERFORMANCE_OPTS", prefix), "-server"));
    }
    env
}

/// Parse `-Xms..` / `-Xmx..` / `-server` back out of container env
pub(crate) fn jvm_options_from_env(prefix: &str, env: &BTreeMap<String, String>) -> Option<JvmOptions> {
    let mut jvm = JvmOptions::default();
    if let Some(heap) = env.get(&format!("{}_HEAP_OPTS", prefix)) {
        for opt in heap.split_whitespace() {
            if let Some(v) = opt.strip_prefix("-Xms") {
                jvm.xms = Some(v.to_string());
            } else if let Some(v) = opt.strip_prefix("-Xmx") {
                jvm.xmx = Some(v.to_string());
            }
        }
    }
    jvm.server = env
        .get(&format!("{}_JVM_PERFORMANCE_OPTS", prefix))
        .is_some_and(|v| v.contains("-server"));
    (jvm != JvmOptions::default()).then_some(jvm)
}

/// Metrics ConfigMap, or its absence when metrics are off
pub(crate) fn metrics_config_map(model: &AssemblyModel, name: &str) -> Result<DesiredResource> {
    match &model.metrics_config {
        None => Ok(DesiredResource::absent(ResourceKind::ConfigMap, name)),
        Some(config) => {
            let manifest = json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": model.metadata(name),
                "data": { METRICS_CONFIG_FILE: config.to_string() },
            });
            Ok(DesiredResource::present(
                ResourceKind::ConfigMap,
                name,
                to_dynamic(manifest)?,
            ))
        }
    }
}

/// Secret holding a credential bundle
pub(crate) fn bundle_secret(
    model: &AssemblyModel,
    name: &str,
    bundle: CredentialBundle,
) -> Result<DesiredResource> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(model.namespace.clone()),
            labels: Some(model.labels_for(name).to_map()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            bundle
                .into_data()
                .into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        ..Default::default()
    };
    Ok(DesiredResource::present(
        ResourceKind::Secret,
        name,
        typed_to_dynamic(&secret)?,
    ))
}

// =============================================================================
// Live workload inspection
// =============================================================================

/// Read-only view over a live workload manifest
pub(crate) struct LiveWorkload<'a> {
    data: &'a Value,
    meta: &'a ObjectMeta,
}

impl<'a> LiveWorkload<'a> {
    pub(crate) fn new(obj: &'a DynamicObject) -> Self {
        Self {
            data: &obj.data,
            meta: &obj.metadata,
        }
    }

    pub(crate) fn labels(&self) -> Labels {
        Labels::from_resource(self.meta)
    }

    pub(crate) fn annotation(&self, key: &str) -> Option<&'a str> {
        self.meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub(crate) fn replicas(&self) -> i32 {
        self.data
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32
    }

    fn pod_spec(&self) -> Option<&'a Value> {
        self.data.pointer("/spec/template/spec")
    }

    /// First application container
    pub(crate) fn container(&self) -> Result<&'a Value> {
        self.pod_spec()
            .and_then(|s| s.get("containers"))
            .and_then(|c| c.get(0))
            .ok_or_else(|| Error::internal_with_context("model", "workload has no containers"))
    }

    pub(crate) fn init_container(&self, name: &str) -> Option<&'a Value> {
        self.pod_spec()
            .and_then(|s| s.get("initContainers"))
            .and_then(Value::as_array)
            .and_then(|ics| {
                ics.iter()
                    .find(|ic| ic.get("name").and_then(Value::as_str) == Some(name))
            })
    }

    pub(crate) fn value(&self, pointer: &str) -> Option<&'a Value> {
        self.data.pointer(pointer)
    }
}

/// Image of a container manifest
pub(crate) fn container_image(container: &Value) -> String {
    container
        .get("image")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Literal env vars of a container manifest
pub(crate) fn container_env(container: &Value) -> BTreeMap<String, String> {
    container
        .get("env")
        .and_then(Value::as_array)
        .map(|vars| {
            vars.iter()
                .filter_map(|v| {
                    let name = v.get("name")?.as_str()?;
                    let value = v.get("value")?.as_str()?;
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Probe timing of a container's readiness probe
pub(crate) fn container_health(container: &Value, default: HealthCheck) -> HealthCheck {
    let probe = container.get("readinessProbe");
    let field = |name: &str| {
        probe
            .and_then(|p| p.get(name))
            .and_then(Value::as_i64)
            .map(|v| v as i32)
    };
    HealthCheck {
        initial_delay: field("initialDelaySeconds").unwrap_or(default.initial_delay),
        timeout: field("timeoutSeconds").unwrap_or(default.timeout),
    }
}
