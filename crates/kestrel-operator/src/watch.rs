//! Reconciliation triggers
//!
//! Each watched namespace and assembly type gets one loop driving two
//! triggers: a periodic batch over every candidate, and a watcher on the
//! configuration ConfigMaps that reconciles single assemblies as they change.
//! Overlapping passes for one assembly are serialized by the assembly lock.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kestrel_common::{Reconciliation, Result};

use crate::assembly::{AssemblyOperator, AssemblyOutcome};
use crate::batch::BatchReport;

/// Trigger name of periodic batches
pub const TIMER_TRIGGER: &str = "timer";
/// Trigger name of configuration events
pub const WATCH_TRIGGER: &str = "watch";

/// Watch timeout; shorter than the client read timeout so the API server
/// closes the watch first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the triggers for one operator in one namespace until the task is dropped
pub async fn run_triggers(
    client: Client,
    operator: Arc<AssemblyOperator>,
    namespace: String,
    interval: Duration,
) {
    let selector = operator
        .selector
        .with_type(operator.assembly_type())
        .with_kind();
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let watcher_config = watcher::Config::default()
        .labels(&selector.selector_string())
        .timeout(WATCH_TIMEOUT_SECS);
    let config_watcher = watcher::watcher(api, watcher_config);
    let mut config_watcher = std::pin::pin!(config_watcher);

    // The first tick fires immediately and doubles as the startup pass
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        assembly_type = %operator.assembly_type(),
        namespace = %namespace,
        selector = %selector.selector_string(),
        interval_ms = interval.as_millis() as u64,
        "triggers started"
    );

    let mut running = None;
    loop {
        tokio::select! {
            Some(event) = config_watcher.next() => {
                handle_config_event(&operator, &namespace, event);
            }
            _ = timer.tick() => {
                start_timer_pass(&operator, &namespace, &mut running);
            }
        }
    }
}

/// Spawn a periodic batch unless the previous one is still running
///
/// Returns whether a batch was started. At most one batch per loop is in
/// flight; configuration events keep flowing while it runs.
pub fn start_timer_pass(
    operator: &Arc<AssemblyOperator>,
    namespace: &str,
    running: &mut Option<JoinHandle<()>>,
) -> bool {
    if running.as_ref().is_some_and(|task| !task.is_finished()) {
        debug!(
            assembly_type = %operator.assembly_type(),
            namespace = %namespace,
            "previous periodic reconciliation still running, skipping tick"
        );
        return false;
    }
    let operator = Arc::clone(operator);
    let namespace = namespace.to_string();
    *running = Some(tokio::spawn(async move {
        if let Err(e) = run_timer_pass(&operator, &namespace).await {
            warn!(
                assembly_type = %operator.assembly_type(),
                namespace = %namespace,
                error = %e,
                "periodic reconciliation failed to start"
            );
        }
    }));
    true
}

/// One periodic batch, awaited to completion
pub async fn run_timer_pass(operator: &Arc<AssemblyOperator>, namespace: &str) -> Result<BatchReport> {
    debug!(
        assembly_type = %operator.assembly_type(),
        namespace = %namespace,
        "running periodic reconciliation"
    );
    let report = operator
        .reconcile_all(TIMER_TRIGGER, namespace, &operator.selector)
        .await?
        .wait()
        .await;
    info!(
        assembly_type = %operator.assembly_type(),
        namespace = %namespace,
        total = report.len(),
        failed = report.failed().len(),
        "periodic reconciliation finished"
    );
    Ok(report)
}

/// React to one configuration watch event
///
/// Applied and deleted resources spawn a single-assembly pass; the pass
/// itself decides between create/update and delete by reading the
/// configuration under the lock.
pub fn handle_config_event(
    operator: &Arc<AssemblyOperator>,
    namespace: &str,
    event: std::result::Result<Event<ConfigMap>, watcher::Error>,
) -> Option<JoinHandle<Result<AssemblyOutcome>>> {
    match event {
        Ok(Event::Apply(config)) | Ok(Event::InitApply(config)) => {
            debug!(name = %config.name_any(), "configuration applied");
            Some(spawn_reconciliation(operator, namespace, &config.name_any()))
        }
        Ok(Event::Delete(config)) => {
            info!(namespace = %namespace, name = %config.name_any(), "configuration deleted");
            Some(spawn_reconciliation(operator, namespace, &config.name_any()))
        }
        Ok(Event::Init) | Ok(Event::InitDone) => {
            debug!(
                assembly_type = %operator.assembly_type(),
                namespace = %namespace,
                "configuration watcher initialized"
            );
            None
        }
        Err(e) => {
            warn!(
                assembly_type = %operator.assembly_type(),
                namespace = %namespace,
                error = %e,
                "Watcher error, will retry"
            );
            None
        }
    }
}

fn spawn_reconciliation(
    operator: &Arc<AssemblyOperator>,
    namespace: &str,
    name: &str,
) -> JoinHandle<Result<AssemblyOutcome>> {
    let operator = Arc::clone(operator);
    let reconciliation =
        Reconciliation::new(WATCH_TRIGGER, operator.assembly_type(), namespace, name);
    // Failures are logged by the coordinator
    tokio::spawn(async move { operator.reconcile_assembly(&reconciliation).await })
}
