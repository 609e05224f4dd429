//! Operator configuration from the environment
//!
//! Reads go through [`EnvSource`] so tests can supply variables without
//! touching process state.

use std::time::Duration;

use kestrel_common::{
    AssemblyType, Error, Labels, Result, DEFAULT_FULL_RECONCILIATION_INTERVAL_MS,
    DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_WORKER_POOL_SIZE,
};

/// Namespaces to watch (comma-separated, required)
pub const ENV_NAMESPACE: &str = "KESTREL_NAMESPACE";
/// Periodic re-sync interval in milliseconds
pub const ENV_FULL_RECONCILIATION_INTERVAL_MS: &str = "KESTREL_FULL_RECONCILIATION_INTERVAL_MS";
/// Assembly lock acquisition timeout in milliseconds
pub const ENV_LOCK_TIMEOUT_MS: &str = "KESTREL_LOCK_TIMEOUT_MS";
/// Extra label selector applied to every lookup
pub const ENV_LABELS: &str = "KESTREL_LABELS";
/// Size of the blocking worker pool
pub const ENV_WORKER_POOL_SIZE: &str = "KESTREL_WORKER_POOL_SIZE";
/// Use Lease-backed locks
pub const ENV_DISTRIBUTED_LOCKS: &str = "KESTREL_DISTRIBUTED_LOCKS";
/// Enable OpenShift-only assembly types
pub const ENV_OPENSHIFT: &str = "KESTREL_OPENSHIFT";
/// Default Kafka broker image
pub const ENV_DEFAULT_KAFKA_IMAGE: &str = "KESTREL_DEFAULT_KAFKA_IMAGE";
/// Default rack-awareness init container image
pub const ENV_DEFAULT_INIT_KAFKA_IMAGE: &str = "KESTREL_DEFAULT_INIT_KAFKA_IMAGE";
/// Default Kafka Connect image
pub const ENV_DEFAULT_CONNECT_IMAGE: &str = "KESTREL_DEFAULT_CONNECT_IMAGE";
/// Default Kafka Connect S2I builder image
pub const ENV_DEFAULT_CONNECT_S2I_IMAGE: &str = "KESTREL_DEFAULT_CONNECT_S2I_IMAGE";

/// Reads configuration variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Images used when a configuration resource doesn't name one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultImages {
    /// Kafka brokers
    pub kafka: String,
    /// Rack-awareness init container
    pub init_kafka: String,
    /// Kafka Connect workers
    pub connect: String,
    /// Kafka Connect S2I builder
    pub connect_s2i: String,
}

impl Default for DefaultImages {
    fn default() -> Self {
        Self {
            kafka: "kestrel/kafka:latest".to_string(),
            init_kafka: "kestrel/kafka-init:latest".to_string(),
            connect: "kestrel/kafka-connect:latest".to_string(),
            connect_s2i: "kestrel/kafka-connect-s2i:latest".to_string(),
        }
    }
}

/// Operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespaces to watch
    pub namespaces: Vec<String>,
    /// Periodic re-sync interval
    pub full_reconciliation_interval: Duration,
    /// Assembly lock acquisition timeout
    pub lock_timeout: Duration,
    /// Extra labels every configuration and managed resource must carry
    pub labels: Labels,
    /// Blocking worker pool size
    pub worker_pool_size: usize,
    /// Use Lease-backed locks instead of the in-memory table
    pub distributed_locks: bool,
    /// Running on OpenShift
    pub openshift: bool,
    /// Default images
    pub images: DefaultImages,
}

impl OperatorConfig {
    /// Read the configuration, failing on missing or malformed values
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let namespaces: Vec<String> = env
            .var(ENV_NAMESPACE)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();
        if namespaces.is_empty() {
            return Err(invalid(ENV_NAMESPACE, "at least one namespace is required"));
        }
        if namespaces.iter().any(|ns| ns == "*") {
            return Err(invalid(ENV_NAMESPACE, "watching all namespaces is not supported"));
        }

        let labels = match env.var(ENV_LABELS) {
            Some(s) => Labels::parse(&s)?,
            None => Labels::empty(),
        };

        let defaults = DefaultImages::default();
        let images = DefaultImages {
            kafka: env.var(ENV_DEFAULT_KAFKA_IMAGE).unwrap_or(defaults.kafka),
            init_kafka: env
                .var(ENV_DEFAULT_INIT_KAFKA_IMAGE)
                .unwrap_or(defaults.init_kafka),
            connect: env.var(ENV_DEFAULT_CONNECT_IMAGE).unwrap_or(defaults.connect),
            connect_s2i: env
                .var(ENV_DEFAULT_CONNECT_S2I_IMAGE)
                .unwrap_or(defaults.connect_s2i),
        };

        Ok(Self {
            namespaces,
            full_reconciliation_interval: Duration::from_millis(parse_number(
                env,
                ENV_FULL_RECONCILIATION_INTERVAL_MS,
                DEFAULT_FULL_RECONCILIATION_INTERVAL_MS,
            )?),
            lock_timeout: Duration::from_millis(parse_number(
                env,
                ENV_LOCK_TIMEOUT_MS,
                DEFAULT_LOCK_TIMEOUT_MS,
            )?),
            labels,
            worker_pool_size: parse_number(
                env,
                ENV_WORKER_POOL_SIZE,
                DEFAULT_WORKER_POOL_SIZE as u64,
            )? as usize,
            distributed_locks: parse_bool(env, ENV_DISTRIBUTED_LOCKS)?,
            openshift: parse_bool(env, ENV_OPENSHIFT)?,
            images,
        })
    }

    /// Assembly types this operator reconciles
    pub fn assembly_types(&self) -> Vec<AssemblyType> {
        AssemblyType::ALL
            .into_iter()
            .filter(|t| self.openshift || *t != AssemblyType::ConnectS2I)
            .collect()
    }
}

fn invalid(key: &str, msg: impl Into<String>) -> Error {
    Error::invalid_configuration_for_field("operator", key, msg)
}

fn parse_number(env: &dyn EnvSource, key: &str, default: u64) -> Result<u64> {
    match env.var(key) {
        None => Ok(default),
        Some(s) => match s.trim().parse::<u64>() {
            Ok(0) => Err(invalid(key, "must be greater than zero")),
            Ok(n) => Ok(n),
            Err(_) => Err(invalid(key, format!("'{}' is not a number", s))),
        },
    }
}

fn parse_bool(env: &dyn EnvSource, key: &str) -> Result<bool> {
    match env.var(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Some(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        Some(s) => Err(invalid(key, format!("'{}' is not a boolean", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> MockEnvSource {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut mock = MockEnvSource::new();
        mock.expect_var().returning(move |k| vars.get(k).cloned());
        mock
    }

    #[test]
    fn defaults_apply_when_only_namespace_is_set() {
        let config = OperatorConfig::from_env(&env(&[(ENV_NAMESPACE, "kafka")])).expect("valid");
        assert_eq!(config.namespaces, vec!["kafka"]);
        assert_eq!(config.full_reconciliation_interval, Duration::from_millis(120_000));
        assert_eq!(config.lock_timeout, Duration::from_millis(60_000));
        assert_eq!(config.worker_pool_size, 10);
        assert!(config.labels.is_empty());
        assert!(!config.distributed_locks);
        assert!(!config.openshift);
        assert_eq!(config.images, DefaultImages::default());
    }

    #[test]
    fn namespace_is_required() {
        let err = OperatorConfig::from_env(&env(&[])).expect_err("missing namespace");
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn all_namespaces_is_rejected() {
        assert!(OperatorConfig::from_env(&env(&[(ENV_NAMESPACE, "*")])).is_err());
    }

    #[test]
    fn reads_every_variable() {
        let config = OperatorConfig::from_env(&env(&[
            (ENV_NAMESPACE, "a, b"),
            (ENV_FULL_RECONCILIATION_INTERVAL_MS, "5000"),
            (ENV_LOCK_TIMEOUT_MS, "1000"),
            (ENV_LABELS, "env=prod"),
            (ENV_WORKER_POOL_SIZE, "4"),
            (ENV_DISTRIBUTED_LOCKS, "true"),
            (ENV_OPENSHIFT, "TRUE"),
            (ENV_DEFAULT_KAFKA_IMAGE, "my/kafka:1"),
        ]))
        .expect("valid");
        assert_eq!(config.namespaces, vec!["a", "b"]);
        assert_eq!(config.full_reconciliation_interval, Duration::from_secs(5));
        assert_eq!(config.lock_timeout, Duration::from_secs(1));
        assert_eq!(config.labels.get("env"), Some("prod"));
        assert_eq!(config.worker_pool_size, 4);
        assert!(config.distributed_locks);
        assert!(config.openshift);
        assert_eq!(config.images.kafka, "my/kafka:1");
        assert_eq!(config.images.connect, "kestrel/kafka-connect:latest");
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = OperatorConfig::from_env(&env(&[
            (ENV_NAMESPACE, "a"),
            (ENV_LOCK_TIMEOUT_MS, "soon"),
        ]))
        .expect_err("bad number");
        match err {
            Error::InvalidConfiguration { field, .. } => {
                assert_eq!(field.as_deref(), Some(ENV_LOCK_TIMEOUT_MS))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_boolean_is_rejected() {
        assert!(OperatorConfig::from_env(&env(&[
            (ENV_NAMESPACE, "a"),
            (ENV_OPENSHIFT, "yes please"),
        ]))
        .is_err());
    }

    #[test]
    fn s2i_needs_openshift() {
        let plain = OperatorConfig::from_env(&env(&[(ENV_NAMESPACE, "a")])).expect("valid");
        assert_eq!(
            plain.assembly_types(),
            vec![AssemblyType::Kafka, AssemblyType::Connect]
        );
        let openshift = OperatorConfig::from_env(&env(&[
            (ENV_NAMESPACE, "a"),
            (ENV_OPENSHIFT, "true"),
        ]))
        .expect("valid");
        assert_eq!(openshift.assembly_types().len(), 3);
    }
}
