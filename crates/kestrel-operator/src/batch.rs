//! Reconciling every assembly of a type in a namespace
//!
//! Candidates are the names of configuration resources plus the cluster
//! names found on live workloads. A name with a workload but no
//! configuration is routed through the delete path by the coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kestrel_common::{labels, Error, Labels, Reconciliation, Result};

use crate::assembly::{AssemblyOperator, AssemblyOutcome};

/// Per-name outcomes of a batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Candidate name to pass result
    pub outcomes: BTreeMap<String, Result<AssemblyOutcome>>,
}

impl BatchReport {
    /// Number of passes
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True if there were no candidates
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Names whose resources were created or updated
    pub fn created_or_updated(&self) -> Vec<&str> {
        self.names(|o| matches!(o, Ok(AssemblyOutcome::CreatedOrUpdated(_))))
    }

    /// Names whose resources were deleted
    pub fn deleted(&self) -> Vec<&str> {
        self.names(|o| matches!(o, Ok(AssemblyOutcome::Deleted(_))))
    }

    /// Names whose pass failed
    pub fn failed(&self) -> Vec<&str> {
        self.names(|o| o.is_err())
    }

    fn names(&self, keep: impl Fn(&Result<AssemblyOutcome>) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| keep(o))
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Completion handle of a submitted batch
pub struct BatchHandle {
    candidates: BTreeSet<String>,
    results: mpsc::UnboundedReceiver<(String, Result<AssemblyOutcome>)>,
}

impl BatchHandle {
    /// Names submitted
    pub fn candidates(&self) -> &BTreeSet<String> {
        &self.candidates
    }

    /// Wait until every submitted pass has reported
    pub async fn wait(mut self) -> BatchReport {
        let mut report = BatchReport::default();
        while let Some((name, outcome)) = self.results.recv().await {
            report.outcomes.insert(name, outcome);
        }
        // A pass that panicked never reports
        for name in self.candidates {
            report.outcomes.entry(name).or_insert_with(|| {
                Err(Error::internal_with_context(
                    "batch",
                    "reconciliation task ended without reporting",
                ))
            });
        }
        report
    }
}

impl AssemblyOperator {
    /// Reconcile every candidate assembly in `namespace` matching `selector`
    ///
    /// The operator's assembly type is always added to `selector`.
    /// Passes run concurrently; one failing never affects the others.
    /// Returns once every pass is submitted; await the handle for outcomes.
    pub async fn reconcile_all(
        self: &Arc<Self>,
        trigger: &str,
        namespace: &str,
        selector: &Labels,
    ) -> Result<BatchHandle> {
        let selector = selector.with_type(self.assembly_type);

        let configs = self
            .config_maps
            .list(namespace, &selector.with_kind())
            .await?;
        let live = self.strategy.live_resources(namespace, &selector).await?;

        let mut candidates: BTreeSet<String> = configs
            .iter()
            .filter_map(|cm| cm.metadata.name.clone())
            .collect();
        candidates.extend(
            live.iter()
                .filter(|meta| labels::kind(meta).is_none())
                .filter_map(|meta| labels::cluster(meta).map(str::to_string)),
        );
        debug!(
            assembly_type = %self.assembly_type,
            namespace = %namespace,
            trigger = %trigger,
            candidates = ?candidates,
            "batch candidates"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        for name in &candidates {
            let operator = Arc::clone(self);
            let tx = tx.clone();
            let reconciliation =
                Reconciliation::new(trigger, self.assembly_type, namespace, name.as_str());
            let name = name.clone();
            tokio::spawn(async move {
                let outcome = operator.reconcile_assembly(&reconciliation).await;
                if let Err(e) = &outcome {
                    warn!(
                        reconciliation = %reconciliation,
                        error = %e,
                        "batch member failed"
                    );
                }
                // The handle may have been dropped; nobody is waiting then
                let _ = tx.send((name, outcome));
            });
        }

        info!(
            assembly_type = %self.assembly_type,
            namespace = %namespace,
            trigger = %trigger,
            count = candidates.len(),
            "batch submitted"
        );
        Ok(BatchHandle {
            candidates,
            results: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::AssemblyType;

    use crate::model::kafka::keys;
    use crate::resource::ResourceKind;
    use crate::testing::{cluster_config, FakePlatform};

    #[tokio::test]
    async fn union_of_configured_and_live_names() {
        let platform = FakePlatform::new();
        let operator = platform.operator(AssemblyType::Kafka);

        // bar and baz get live resources, then baz loses its configuration
        for name in ["bar", "baz"] {
            platform.config_maps.insert(cluster_config(
                AssemblyType::Kafka,
                "test",
                name,
                &[(keys::TLS, "false")],
            ));
            let rec = Reconciliation::new("setup", AssemblyType::Kafka, "test", name);
            operator.reconcile_assembly(&rec).await.expect("setup");
        }
        platform.config_maps.remove("test", "baz");
        platform.config_maps.insert(cluster_config(
            AssemblyType::Kafka,
            "test",
            "foo",
            &[(keys::TLS, "false")],
        ));

        let handle = operator
            .reconcile_all("test", "test", &Labels::empty())
            .await.expect("submitted");
        assert_eq!(
            handle.candidates().iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["bar", "baz", "foo"]
        );
        let report = handle.wait().await;

        assert_eq!(report.len(), 3);
        assert_eq!(report.created_or_updated(), vec!["bar", "foo"]);
        assert_eq!(report.deleted(), vec!["baz"]);
        assert!(report.failed().is_empty());
        assert!(platform
            .resource(ResourceKind::StatefulSet)
            .stored("test", "baz-kafka")
            .is_none());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let platform = FakePlatform::new();
        platform.config_maps.insert(cluster_config(
            AssemblyType::Kafka,
            "test",
            "good",
            &[(keys::TLS, "false")],
        ));
        platform.config_maps.insert(cluster_config(
            AssemblyType::Kafka,
            "test",
            "bad",
            &[(keys::REPLICAS, "many")],
        ));
        let operator = platform.operator(AssemblyType::Kafka);

        let report = operator
            .reconcile_all("timer", "test", &Labels::empty())
            .await
            .expect("submitted")
            .wait()
            .await;
        assert_eq!(report.failed(), vec!["bad"]);
        assert_eq!(report.created_or_updated(), vec!["good"]);
        assert!(report.outcomes["bad"]
            .as_ref()
            .is_err_and(|e| e.is_invalid_configuration()));
    }

    #[tokio::test]
    async fn other_types_are_not_candidates() {
        let platform = FakePlatform::new();
        platform.config_maps.insert(cluster_config(
            AssemblyType::Connect,
            "test",
            "workers",
            &[],
        ));
        let report = platform
            .operator(AssemblyType::Kafka)
            .reconcile_all("timer", "test", &Labels::empty())
            .await
            .expect("submitted")
            .wait()
            .await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn selector_narrows_candidates() {
        let platform = FakePlatform::new();
        let mut labelled =
            cluster_config(AssemblyType::Kafka, "test", "foo", &[(keys::TLS, "false")]);
        labelled
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "streaming".to_string());
        platform.config_maps.insert(labelled);
        platform.config_maps.insert(cluster_config(
            AssemblyType::Kafka,
            "test",
            "bar",
            &[(keys::TLS, "false")],
        ));

        let handle = platform
            .operator(AssemblyType::Kafka)
            .reconcile_all("timer", "test", &Labels::empty().with("team", "streaming"))
            .await
            .expect("submitted");
        assert_eq!(
            handle.candidates().iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["foo"]
        );
        assert_eq!(handle.wait().await.created_or_updated(), vec!["foo"]);
    }

    #[tokio::test]
    async fn interrupted_delete_is_finished_by_a_later_batch() {
        let platform = FakePlatform::new();
        platform.config_maps.insert(cluster_config(
            AssemblyType::Kafka,
            "test",
            "foo",
            &[(keys::TLS, "false")],
        ));
        let operator = platform.operator(AssemblyType::Kafka);
        let rec = Reconciliation::new("setup", AssemblyType::Kafka, "test", "foo");
        operator.reconcile_assembly(&rec).await.expect("setup");

        platform.config_maps.remove("test", "foo");
        platform
            .resource(ResourceKind::Service)
            .fail_next_delete("test", "foo-kafka");
        let first = operator
            .reconcile_all("timer", "test", &Labels::empty())
            .await
            .expect("submitted")
            .wait()
            .await;
        assert_eq!(first.failed(), vec!["foo"]);
        assert!(platform
            .resource(ResourceKind::StatefulSet)
            .stored("test", "foo-kafka")
            .is_some());

        let second = operator
            .reconcile_all("timer", "test", &Labels::empty())
            .await
            .expect("submitted")
            .wait()
            .await;
        assert_eq!(second.deleted(), vec!["foo"]);
        for kind in [ResourceKind::StatefulSet, ResourceKind::Service] {
            assert!(platform.resource(kind).stored("test", "foo-kafka").is_none(), "{kind}");
        }
        assert!(platform
            .resource(ResourceKind::Service)
            .stored("test", "foo-kafka-headless")
            .is_none());
    }
}
