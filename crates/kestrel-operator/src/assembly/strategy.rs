//! Per-type planning, applying and deleting

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use kestrel_common::{AssemblyType, Labels, Reconciliation, Result};
use kestrel_pki::TrustDomain;

use crate::certificates::{Credentials, MemberIssuer};
use crate::diff::{self, Action, ResourcePlan, ScaleStep};
use crate::model::AssemblyModelBuilder;
use crate::resource::{ResourceKind, ResourceOperators};

/// Something done to one resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedAction {
    /// Kind
    pub kind: ResourceKind,
    /// Name
    pub name: String,
    /// Action on the object
    pub action: Action,
    /// Replica change issued after the action
    pub scale: Option<ScaleStep>,
}

/// Everything one pass did, in order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Per-resource actions
    pub actions: Vec<AppliedAction>,
}

impl ApplyReport {
    /// Number of resources that got `action`
    pub fn count(&self, action: Action) -> usize {
        self.actions.iter().filter(|a| a.action == action).count()
    }

    /// Number of scale steps issued
    pub fn scale_steps(&self) -> usize {
        self.actions.iter().filter(|a| a.scale.is_some()).count()
    }

    /// True if nothing was created, updated, deleted or scaled
    pub fn is_noop(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.action == Action::Noop && a.scale.is_none())
    }
}

/// How one assembly type is reconciled
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AssemblyStrategy: Send + Sync {
    /// Assembly type handled
    fn assembly_type(&self) -> AssemblyType;

    /// Decide what to do with every resource the configuration implies
    async fn plan(
        &self,
        reconciliation: &Reconciliation,
        config: &ConfigMap,
        credentials: &Credentials,
    ) -> Result<Vec<ResourcePlan>>;

    /// Carry out `plans` in order, stopping at the first failure
    async fn apply(
        &self,
        reconciliation: &Reconciliation,
        plans: Vec<ResourcePlan>,
    ) -> Result<ApplyReport>;

    /// Remove every resource of a cluster whose configuration is gone
    async fn delete(&self, reconciliation: &Reconciliation) -> Result<ApplyReport>;

    /// Metadata of live workloads matching `selector`
    async fn live_resources(&self, namespace: &str, selector: &Labels) -> Result<Vec<ObjectMeta>>;
}

/// Strategy driven by an [`AssemblyModelBuilder`]
pub struct ModelStrategy {
    builder: Arc<dyn AssemblyModelBuilder>,
    operators: ResourceOperators,
    issuer: MemberIssuer,
    labels: Labels,
}

impl ModelStrategy {
    /// Create the strategy
    ///
    /// `labels` are added to every generated resource so that lookups with
    /// the operator's selector find them again.
    pub fn new(
        builder: Arc<dyn AssemblyModelBuilder>,
        operators: ResourceOperators,
        issuer: MemberIssuer,
        labels: Labels,
    ) -> Self {
        Self {
            builder,
            operators,
            issuer,
            labels,
        }
    }
}

#[async_trait]
impl AssemblyStrategy for ModelStrategy {
    fn assembly_type(&self) -> AssemblyType {
        self.builder.assembly_type()
    }

    async fn plan(
        &self,
        reconciliation: &Reconciliation,
        config: &ConfigMap,
        credentials: &Credentials,
    ) -> Result<Vec<ResourcePlan>> {
        let mut model = self.builder.from_config(config)?;
        model.labels = model.labels.merged(&self.labels);

        // A TLS cluster scaled to zero still carries its bundles, just empty
        let cluster = model.cluster.clone();
        let has_bundles = self
            .builder
            .member_bundle_name(&cluster, TrustDomain::Internal)
            .is_some();
        if model.tls_enabled && has_bundles {
            let members = self.builder.member_names(&model);
            let certificates = self
                .issuer
                .issue(&credentials.authorities, &members, |domain| {
                    self.builder
                        .member_bundle_name(&cluster, domain)
                        .and_then(|name| credentials.members(&name, domain))
                })
                .await?;
            model = model.with_certificates(certificates);
        }

        let namespace = reconciliation.namespace();
        let mut plans = Vec::new();
        for desired in self.builder.generate_desired(&model)? {
            let live = self
                .operators
                .get(desired.kind)?
                .get(namespace, &desired.name)
                .await?;
            let plan = diff::plan(&desired, live.as_ref());
            debug!(
                kind = %plan.kind,
                name = %plan.name,
                action = %plan.action,
                scale = ?plan.scale,
                "planned"
            );
            plans.push(plan);
        }
        Ok(plans)
    }

    async fn apply(
        &self,
        reconciliation: &Reconciliation,
        plans: Vec<ResourcePlan>,
    ) -> Result<ApplyReport> {
        let namespace = reconciliation.namespace();
        let mut report = ApplyReport::default();
        for plan in plans {
            let operator = self.operators.get(plan.kind)?;
            match plan.action {
                Action::Create | Action::UpdateInPlace => {
                    operator
                        .reconcile(namespace, &plan.name, plan.object.clone())
                        .await?;
                }
                Action::Delete => {
                    operator.reconcile(namespace, &plan.name, None).await?;
                }
                Action::Noop => {}
            }
            match plan.scale {
                Some(ScaleStep::Up(replicas)) => {
                    operator.scale_up(namespace, &plan.name, replicas).await?;
                }
                Some(ScaleStep::Down(replicas)) => {
                    operator.scale_down(namespace, &plan.name, replicas).await?;
                }
                None => {}
            }
            report.actions.push(AppliedAction {
                kind: plan.kind,
                name: plan.name,
                action: plan.action,
                scale: plan.scale,
            });
        }
        Ok(report)
    }

    async fn delete(&self, reconciliation: &Reconciliation) -> Result<ApplyReport> {
        let namespace = reconciliation.namespace();
        let cluster = reconciliation.name();
        let mut report = ApplyReport::default();

        let (workload_kind, workload_name) = self.builder.workload(cluster);
        let live = self
            .operators
            .get(workload_kind)?
            .get(namespace, &workload_name)
            .await?;
        if let Some(live) = live {
            let model = self
                .builder
                .from_live_resource(namespace, cluster, &live)?;
            let claims = self.builder.claims_to_delete(&model);
            if !claims.is_empty() {
                info!(
                    reconciliation = %reconciliation,
                    claims = claims.len(),
                    "deleting persistent volume claims"
                );
            }
            let claim_operator = self.operators.get(ResourceKind::PersistentVolumeClaim)?;
            for claim in claims {
                claim_operator.reconcile(namespace, &claim, None).await?;
                report.actions.push(AppliedAction {
                    kind: ResourceKind::PersistentVolumeClaim,
                    name: claim,
                    action: Action::Delete,
                    scale: None,
                });
            }
        }

        for (kind, name) in self.builder.managed_resources(cluster) {
            self.operators
                .get(kind)?
                .reconcile(namespace, &name, None)
                .await?;
            report.actions.push(AppliedAction {
                kind,
                name,
                action: Action::Delete,
                scale: None,
            });
        }
        Ok(report)
    }

    async fn live_resources(&self, namespace: &str, selector: &Labels) -> Result<Vec<ObjectMeta>> {
        let (kind, _) = self.builder.workload("");
        let live = self.operators.get(kind)?.list(namespace, selector).await?;
        Ok(live.into_iter().map(|obj| obj.metadata).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::AssemblyOperator;
    use crate::config::DefaultImages;
    use crate::model::kafka::keys;
    use crate::model::KafkaModelBuilder;
    use crate::testing::{cluster_config, Call, FakePlatform};
    use kestrel_common::WorkerPool;

    fn strategy(platform: &FakePlatform) -> ModelStrategy {
        ModelStrategy::new(
            Arc::new(KafkaModelBuilder::new(DefaultImages::default())),
            platform.operators(),
            MemberIssuer::new(platform.certs.clone(), WorkerPool::new(2)),
            Labels::empty(),
        )
    }

    async fn reconcile_kafka(platform: &FakePlatform, data: &[(&str, &str)]) -> ApplyReport {
        platform.config_maps.insert(cluster_config(
            AssemblyType::Kafka,
            "test",
            "my-cluster",
            data,
        ));
        let operator = AssemblyOperator::for_type(&platform.context(), AssemblyType::Kafka);
        let rec = Reconciliation::new("test", AssemblyType::Kafka, "test", "my-cluster");
        match operator.reconcile_assembly(&rec).await.expect("reconciled") {
            crate::assembly::AssemblyOutcome::CreatedOrUpdated(report) => report,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scale_up_issues_one_scale_up_to_target() {
        let platform = FakePlatform::new();
        reconcile_kafka(&platform, &[(keys::REPLICAS, "3")]).await;
        platform.clear_calls();

        let report = reconcile_kafka(&platform, &[(keys::REPLICAS, "4")]).await;
        let calls = platform.resource(ResourceKind::StatefulSet).calls("test");
        let scale_ups: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::ScaleUp(..)))
            .collect();
        assert_eq!(scale_ups, vec![&Call::ScaleUp("my-cluster-kafka".to_string(), 4)]);
        assert!(!calls.iter().any(|c| matches!(c, Call::ScaleDown(..))));
        assert_eq!(report.scale_steps(), 1);
    }

    #[tokio::test]
    async fn scale_down_issues_one_scale_down_to_target() {
        let platform = FakePlatform::new();
        reconcile_kafka(&platform, &[(keys::REPLICAS, "4")]).await;
        platform.clear_calls();

        reconcile_kafka(&platform, &[(keys::REPLICAS, "2")]).await;
        let calls = platform.resource(ResourceKind::StatefulSet).calls("test");
        let scale_downs: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::ScaleDown(..)))
            .collect();
        assert_eq!(
            scale_downs,
            vec![&Call::ScaleDown("my-cluster-kafka".to_string(), 2)]
        );
        assert!(!calls.iter().any(|c| matches!(c, Call::ScaleUp(..))));
        assert_eq!(
            platform
                .resource(ResourceKind::StatefulSet)
                .stored("test", "my-cluster-kafka")
                .and_then(|o| crate::resource::replicas(&o)),
            Some(2)
        );
    }

    #[tokio::test]
    async fn delete_recovers_claims_from_live_workload() {
        let platform = FakePlatform::new();
        reconcile_kafka(
            &platform,
            &[
                (keys::REPLICAS, "2"),
                (keys::TLS, "false"),
                (
                    keys::STORAGE,
                    r#"{"type":"persistent-claim","size":"1Gi","delete-claim":true}"#,
                ),
            ],
        )
        .await;

        let rec = Reconciliation::new("test", AssemblyType::Kafka, "test", "my-cluster");
        let report = strategy(&platform).delete(&rec).await.expect("deleted");

        assert_eq!(
            platform
                .resource(ResourceKind::PersistentVolumeClaim)
                .calls("test"),
            vec![
                Call::Delete("data-my-cluster-kafka-0".to_string()),
                Call::Delete("data-my-cluster-kafka-1".to_string()),
            ]
        );
        assert_eq!(report.count(Action::Delete), 2 + 7);
        assert!(platform
            .resource(ResourceKind::StatefulSet)
            .stored("test", "my-cluster-kafka")
            .is_none());
    }

    #[tokio::test]
    async fn delete_without_live_workload_keeps_claims() {
        let platform = FakePlatform::new();
        let rec = Reconciliation::new("test", AssemblyType::Kafka, "test", "gone");
        let report = strategy(&platform).delete(&rec).await.expect("deleted");
        assert!(platform
            .resource(ResourceKind::PersistentVolumeClaim)
            .calls("test")
            .is_empty());
        assert_eq!(report.count(Action::Delete), 7);
    }

    #[tokio::test]
    async fn apply_stops_at_first_failure() {
        let mut failing = crate::resource::MockResourceOperator::new();
        failing.expect_kind().return_const(ResourceKind::Service);
        failing.expect_reconcile().times(1).returning(|ns, name, _| {
            Err(kestrel_common::Error::resource_operation(
                "reconcile", "Service", ns, name, "boom",
            ))
        });
        let platform = FakePlatform::new();
        let operators = platform.operators().with(Arc::new(failing));
        let strategy = ModelStrategy::new(
            Arc::new(KafkaModelBuilder::new(DefaultImages::default())),
            operators,
            MemberIssuer::new(platform.certs.clone(), WorkerPool::new(1)),
            Labels::empty(),
        );

        let plans = vec![
            ResourcePlan {
                kind: ResourceKind::Service,
                name: "a".to_string(),
                action: Action::Delete,
                scale: None,
                object: None,
            },
            ResourcePlan {
                kind: ResourceKind::ConfigMap,
                name: "b".to_string(),
                action: Action::Delete,
                scale: None,
                object: None,
            },
        ];
        let rec = Reconciliation::new("test", AssemblyType::Kafka, "test", "c");
        assert!(strategy.apply(&rec, plans).await.is_err());
        assert!(platform.resource(ResourceKind::ConfigMap).calls("test").is_empty());
    }
}
