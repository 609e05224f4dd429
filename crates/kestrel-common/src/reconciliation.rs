//! Assembly identities and reconciliation requests

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Error;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The kind of cluster an assembly describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssemblyType {
    /// Kafka brokers
    Kafka,
    /// Kafka Connect workers
    Connect,
    /// Kafka Connect workers built through source-to-image
    ConnectS2I,
}

impl AssemblyType {
    /// All assembly types, in a stable order
    pub const ALL: [AssemblyType; 3] = [Self::Kafka, Self::Connect, Self::ConnectS2I];

    /// Value used in labels and lock names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::Connect => "kafka-connect",
            Self::ConnectS2I => "kafka-connect-s2i",
        }
    }
}

impl fmt::Display for AssemblyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssemblyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kafka" => Ok(Self::Kafka),
            "kafka-connect" => Ok(Self::Connect),
            "kafka-connect-s2i" => Ok(Self::ConnectS2I),
            other => Err(Error::internal_with_context(
                "assembly-type",
                format!("unknown assembly type '{}'", other),
            )),
        }
    }
}

/// Addresses one assembly: its type, namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssemblyIdentity {
    /// Assembly type
    pub assembly_type: AssemblyType,
    /// Namespace holding the configuration resource
    pub namespace: String,
    /// Cluster name
    pub name: String,
}

impl AssemblyIdentity {
    /// Create an identity
    pub fn new(
        assembly_type: AssemblyType,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            assembly_type,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the lock serializing reconciliations of this assembly
    pub fn lock_name(&self) -> String {
        format!(
            "lock::{}::{}::{}",
            self.namespace, self.assembly_type, self.name
        )
    }
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}/{})", self.assembly_type, self.namespace, self.name)
    }
}

/// One attempt at reconciling one assembly
///
/// Immutable; cloned freely into log spans and strategy calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    id: u64,
    trigger: String,
    identity: AssemblyIdentity,
}

impl Reconciliation {
    /// Create a request with a fresh process-unique id
    pub fn new(
        trigger: impl Into<String>,
        assembly_type: AssemblyType,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            trigger: trigger.into(),
            identity: AssemblyIdentity::new(assembly_type, namespace, name),
        }
    }

    /// Process-unique, monotonically increasing id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What caused this attempt ("timer", "watch", ...)
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// The assembly being reconciled
    pub fn identity(&self) -> &AssemblyIdentity {
        &self.identity
    }

    /// Assembly type
    pub fn assembly_type(&self) -> AssemblyType {
        self.identity.assembly_type
    }

    /// Namespace
    pub fn namespace(&self) -> &str {
        &self.identity.namespace
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Lock name for this assembly
    pub fn lock_name(&self) -> String {
        self.identity.lock_name()
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reconciliation #{}({}) {}",
            self.id, self.trigger, self.identity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_name_includes_type_namespace_and_name() {
        let identity = AssemblyIdentity::new(AssemblyType::Kafka, "test", "my-cluster");
        assert_eq!(identity.lock_name(), "lock::test::kafka::my-cluster");

        let connect = AssemblyIdentity::new(AssemblyType::ConnectS2I, "test", "my-cluster");
        assert_eq!(
            connect.lock_name(),
            "lock::test::kafka-connect-s2i::my-cluster"
        );
    }

    #[test]
    fn ids_increase() {
        let a = Reconciliation::new("timer", AssemblyType::Kafka, "ns", "a");
        let b = Reconciliation::new("timer", AssemblyType::Kafka, "ns", "a");
        assert!(b.id() > a.id());
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn display_carries_trigger_and_identity() {
        let r = Reconciliation::new("watch", AssemblyType::Connect, "ns", "foo");
        assert_eq!(
            r.to_string(),
            format!("Reconciliation #{}(watch) kafka-connect(ns/foo)", r.id())
        );
    }

    #[test]
    fn assembly_type_parses_its_label_value() {
        for t in AssemblyType::ALL {
            assert_eq!(t.as_str().parse::<AssemblyType>().expect("known type"), t);
        }
        assert!("zookeeper".parse::<AssemblyType>().is_err());
    }
}
