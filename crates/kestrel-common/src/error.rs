//! Error types for the kestrel operator
//!
//! Errors carry the context needed to correlate a failure with the assembly
//! and resource it concerns. Every variant maps onto one of the three outcome
//! classes reported to callers (see [`FailureKind`]).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kestrel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration for an assembly. Never retried
    /// automatically: the user has to fix the configuration resource.
    #[error("invalid configuration for {cluster}: {message}")]
    InvalidConfiguration {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The configuration key at fault (e.g. "kafka-storage")
        field: Option<String>,
    },

    /// The assembly lock could not be acquired in time
    #[error("timed out after {timeout_ms}ms waiting for lock {lock}")]
    LockTimeout {
        /// Name of the contended lock
        lock: String,
        /// How long we waited
        timeout_ms: u64,
    },

    /// Key, certificate or signing request generation failed
    #[error("certificate generation failed [{context}]: {message}")]
    CertificateGeneration {
        /// What was being generated (e.g. "internal-ca", "my-cluster-kafka-0")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A platform CRUD operation on a managed resource failed
    #[error("{operation} {kind} {namespace}/{name} failed: {message}")]
    ResourceOperation {
        /// Operation that failed (get, list, reconcile, delete, scale-up, scale-down)
        operation: String,
        /// Resource kind
        kind: String,
        /// Namespace of the resource
        namespace: String,
        /// Name of the resource (empty for list operations)
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error not attributed to a specific resource
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "worker-pool", "watcher")
        context: String,
    },
}

/// Outcome class of a failed reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The configuration resource is wrong; fix it
    InvalidConfiguration,
    /// Another reconciliation held the lock; the next trigger retries
    LockTimeout,
    /// The controller or the platform is unhealthy; the next trigger retries
    PlatformFailure,
}

impl Error {
    /// Create an invalid configuration error with cluster context
    pub fn invalid_configuration(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create an invalid configuration error naming the offending key
    pub fn invalid_configuration_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidConfiguration {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(lock: impl Into<String>, timeout_ms: u64) -> Self {
        Self::LockTimeout {
            lock: lock.into(),
            timeout_ms,
        }
    }

    /// Create a certificate generation error
    pub fn certificate_generation(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertificateGeneration {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a resource operation error
    pub fn resource_operation(
        operation: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ResourceOperation {
            operation: operation.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error into one of the reported outcome classes
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidConfiguration { .. } => FailureKind::InvalidConfiguration,
            Self::LockTimeout { .. } => FailureKind::LockTimeout,
            Self::CertificateGeneration { .. }
            | Self::ResourceOperation { .. }
            | Self::Kube { .. }
            | Self::Internal { .. } => FailureKind::PlatformFailure,
        }
    }

    /// True if the user has to fix the configuration resource
    pub fn is_invalid_configuration(&self) -> bool {
        self.kind() == FailureKind::InvalidConfiguration
    }

    /// Whether a later trigger can be expected to succeed without user action
    pub fn is_retryable(&self) -> bool {
        !self.is_invalid_configuration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_names_field() {
        let err = Error::invalid_configuration_for_field("my-cluster", "kafka-storage", "bad json");
        assert_eq!(
            err.to_string(),
            "invalid configuration for my-cluster: bad json"
        );
        match err {
            Error::InvalidConfiguration { field, .. } => {
                assert_eq!(field.as_deref(), Some("kafka-storage"))
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn failure_kinds_are_distinguished() {
        assert_eq!(
            Error::invalid_configuration("c", "m").kind(),
            FailureKind::InvalidConfiguration
        );
        assert_eq!(
            Error::lock_timeout("lock::ns::kafka::c", 60_000).kind(),
            FailureKind::LockTimeout
        );
        assert_eq!(
            Error::certificate_generation("internal-ca", "boom").kind(),
            FailureKind::PlatformFailure
        );
        assert_eq!(
            Error::resource_operation("reconcile", "StatefulSet", "ns", "c-kafka", "500").kind(),
            FailureKind::PlatformFailure
        );
    }

    #[test]
    fn only_configuration_errors_need_user_action() {
        assert!(!Error::invalid_configuration("c", "m").is_retryable());
        assert!(Error::lock_timeout("l", 1).is_retryable());
        assert!(Error::internal("x").is_retryable());
    }

    #[test]
    fn resource_operation_message_has_full_context() {
        let err = Error::resource_operation("scale-up", "Deployment", "test", "foo-connect", "conflict");
        assert_eq!(
            err.to_string(),
            "scale-up Deployment test/foo-connect failed: conflict"
        );
    }
}
