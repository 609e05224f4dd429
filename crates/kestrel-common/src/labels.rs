//! Labels attached to configuration resources and managed resources
//!
//! Configuration ConfigMaps carry `kestrel.io/kind=cluster` and
//! `kestrel.io/type=<assembly type>`. Every resource generated for an
//! assembly carries the type, the cluster name and its own name, but never
//! the kind label. That difference is what lets candidate discovery tell a
//! configuration resource apart from the resources it produced.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::reconciliation::AssemblyType;
use crate::Error;

/// Label domain shared by all kestrel labels
pub const LABEL_DOMAIN: &str = "kestrel.io/";

/// Label marking configuration resources (`cluster`)
pub const KIND_LABEL: &str = "kestrel.io/kind";

/// Label carrying the assembly type
pub const TYPE_LABEL: &str = "kestrel.io/type";

/// Label carrying the cluster (assembly) name
pub const CLUSTER_LABEL: &str = "kestrel.io/cluster";

/// Label carrying the name of the generated resource
pub const NAME_LABEL: &str = "kestrel.io/name";

/// Value of [`KIND_LABEL`] on configuration resources
pub const CLUSTER_KIND: &str = "cluster";

/// An immutable set of labels, also usable as an equality selector
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// No labels; selects everything
    pub fn empty() -> Self {
        Self::default()
    }

    /// Labels identifying the resources of one cluster
    pub fn for_cluster(cluster: &str) -> Self {
        Self::empty().with(CLUSTER_LABEL, cluster)
    }

    /// Labels identifying resources of one assembly type
    pub fn for_type(assembly_type: AssemblyType) -> Self {
        Self::empty().with_type(assembly_type)
    }

    /// Build from an arbitrary map
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// The kestrel labels of an existing resource; foreign labels are dropped
    pub fn from_resource(meta: &ObjectMeta) -> Self {
        let map = meta
            .labels
            .iter()
            .flatten()
            .filter(|(k, _)| k.starts_with(LABEL_DOMAIN))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self(map)
    }

    /// Parse a `k=v,k2=v2` selector string
    pub fn parse(selector: &str) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        for pair in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::invalid_configuration_for_field(
                    "operator",
                    "labels",
                    format!("label '{}' is not of the form key=value", pair),
                )
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::invalid_configuration_for_field(
                    "operator",
                    "labels",
                    format!("label '{}' has an empty key", pair),
                ));
            }
            map.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self(map))
    }

    /// Return a copy with one more label
    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut map = self.0.clone();
        map.insert(key.to_string(), value.to_string());
        Self(map)
    }

    /// Return a copy with the assembly type label set
    pub fn with_type(&self, assembly_type: AssemblyType) -> Self {
        self.with(TYPE_LABEL, assembly_type.as_str())
    }

    /// Return a copy with the cluster label set
    pub fn with_cluster(&self, cluster: &str) -> Self {
        self.with(CLUSTER_LABEL, cluster)
    }

    /// Return a copy with the resource name label set
    pub fn with_name(&self, name: &str) -> Self {
        self.with(NAME_LABEL, name)
    }

    /// Return a copy marked as a configuration resource
    pub fn with_kind(&self) -> Self {
        self.with(KIND_LABEL, CLUSTER_KIND)
    }

    /// Return a copy without the configuration-resource marker
    pub fn without_kind(&self) -> Self {
        let mut map = self.0.clone();
        map.remove(KIND_LABEL);
        Self(map)
    }

    /// Return a copy without the resource-name label
    pub fn without_name(&self) -> Self {
        let mut map = self.0.clone();
        map.remove(NAME_LABEL);
        Self(map)
    }

    /// Return a copy extended with every label of `other`
    pub fn merged(&self, other: &Labels) -> Self {
        let mut map = self.0.clone();
        map.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(map)
    }

    /// Whether every label of this selector is present on `meta`
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let labels = meta.labels.as_ref();
        self.0
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    /// Label selector string for list/watch calls
    pub fn selector_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// True if no labels are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a label value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The underlying map, for embedding in resource metadata
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector_string())
    }
}

/// The cluster name recorded on a resource, if any
pub fn cluster(meta: &ObjectMeta) -> Option<&str> {
    label(meta, CLUSTER_LABEL)
}

/// The configuration-resource marker on a resource, if any
pub fn kind(meta: &ObjectMeta) -> Option<&str> {
    label(meta, KIND_LABEL)
}

/// The assembly type recorded on a resource, if any
pub fn assembly_type(meta: &ObjectMeta) -> Option<AssemblyType> {
    label(meta, TYPE_LABEL).and_then(|t| t.parse().ok())
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}
