//! A Kafka assembly from first configuration to deletion

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{Api, DeleteParams, PostParams};

use kestrel_common::{AssemblyType, Reconciliation};
use kestrel_operator::AssemblyOutcome;

use super::helpers::{client, cluster_config, fresh_namespace, operator};

const NAMESPACE: &str = "kestrel-kind-kafka";

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn kafka_assembly_lifecycle() {
    let client = client().await;
    fresh_namespace(&client, NAMESPACE).await;
    let operator = operator(client.clone(), NAMESPACE, AssemblyType::Kafka);

    let configs: Api<ConfigMap> = Api::namespaced(client.clone(), NAMESPACE);
    configs
        .create(
            &PostParams::default(),
            &cluster_config(AssemblyType::Kafka, NAMESPACE, "events", &[("kafka-nodes", "2")]),
        )
        .await
        .expect("create configuration");

    let pass = || Reconciliation::new("kind", AssemblyType::Kafka, NAMESPACE, "events");

    let created = operator.reconcile_assembly(&pass()).await.expect("created");
    assert!(matches!(created, AssemblyOutcome::CreatedOrUpdated(_)));

    let sets: Api<StatefulSet> = Api::namespaced(client.clone(), NAMESPACE);
    let set = sets.get("events-kafka").await.expect("statefulset");
    assert_eq!(set.spec.and_then(|s| s.replicas), Some(2));

    let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
    services.get("events-kafka").await.expect("client service");
    services.get("events-kafka-headless").await.expect("headless service");

    let secrets: Api<Secret> = Api::namespaced(client.clone(), NAMESPACE);
    secrets.get("internal-ca").await.expect("internal authority");
    secrets.get("clients-ca").await.expect("clients authority");
    secrets
        .get("events-kafka-brokers-internal")
        .await
        .expect("internal member bundle");

    let again = operator.reconcile_assembly(&pass()).await.expect("resynced");
    assert!(again.report().is_noop(), "second pass changed {:?}", again.report());

    configs
        .delete("events", &DeleteParams::default())
        .await
        .expect("delete configuration");
    let deleted = operator.reconcile_assembly(&pass()).await.expect("deleted");
    assert!(matches!(deleted, AssemblyOutcome::Deleted(_)));
    assert!(sets.get_opt("events-kafka").await.expect("get").is_none());
    // Authorities are shared by the namespace and outlive the cluster
    assert!(secrets.get_opt("internal-ca").await.expect("get").is_some());
}
