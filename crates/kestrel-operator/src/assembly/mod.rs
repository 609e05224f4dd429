//! Reconciliation coordinator
//!
//! One pass for one assembly runs through these phases:
//!
//! ```text
//! Idle -> LockPending -> Locked -> CertificatePhase -> DiffPhase -> Applying -> Released
//!                                 \-- no configuration ----------------------> Applying (delete)
//! ```
//!
//! The assembly lock is held from `Locked` until `Released` and is released
//! on every exit path. The first failure ends the pass; nothing applied
//! earlier in the pass is rolled back. The next trigger re-diffs from
//! whatever state was reached.

pub mod strategy;

pub use strategy::{AppliedAction, ApplyReport, AssemblyStrategy, ModelStrategy};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use kestrel_common::{
    AssemblyType, Error, FailureKind, Labels, LockService, Reconciliation, Result, WorkerPool,
};
use kestrel_pki::CertManager;

use crate::certificates::{AuthorityManager, Credentials, MemberIssuer};
use crate::config::DefaultImages;
use crate::model::{
    AssemblyModelBuilder, ConnectModelBuilder, ConnectS2IModelBuilder, KafkaModelBuilder,
};
use crate::resource::{ConfigMapOperations, ResourceOperators, SecretOperations};

/// Collaborators shared by every assembly operator
#[derive(Clone)]
pub struct OperatorContext {
    /// Configuration store
    pub config_maps: Arc<dyn ConfigMapOperations>,
    /// Credential store
    pub secrets: Arc<dyn SecretOperations>,
    /// Assembly and authority locks
    pub locks: Arc<dyn LockService>,
    /// Certificate primitive
    pub cert_manager: Arc<dyn CertManager>,
    /// Per-kind resource operators
    pub operators: ResourceOperators,
    /// Blocking worker pool
    pub pool: WorkerPool,
    /// Lock acquisition timeout
    pub lock_timeout: Duration,
    /// Extra labels every lookup must match
    pub selector: Labels,
    /// Default images
    pub images: DefaultImages,
}

/// Coordinator state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the assembly lock
    LockPending,
    /// Lock held, loading configuration
    Locked,
    /// Ensuring namespace authorities
    CertificatePhase,
    /// Building the model and comparing against live state
    DiffPhase,
    /// Issuing resource actions
    Applying,
    /// Lock released
    Released,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::LockPending => "lock-pending",
            Phase::Locked => "locked",
            Phase::CertificatePhase => "certificates",
            Phase::DiffPhase => "diff",
            Phase::Applying => "applying",
            Phase::Released => "released",
        })
    }
}

/// How a successful pass ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// Configuration present; resources created or updated
    CreatedOrUpdated(ApplyReport),
    /// Configuration absent; resources deleted
    Deleted(ApplyReport),
}

impl AssemblyOutcome {
    /// Actions taken
    pub fn report(&self) -> &ApplyReport {
        match self {
            Self::CreatedOrUpdated(report) | Self::Deleted(report) => report,
        }
    }
}

/// Reconciles every assembly of one type
pub struct AssemblyOperator {
    pub(crate) assembly_type: AssemblyType,
    pub(crate) config_maps: Arc<dyn ConfigMapOperations>,
    pub(crate) secrets: Arc<dyn SecretOperations>,
    pub(crate) locks: Arc<dyn LockService>,
    pub(crate) authorities: AuthorityManager,
    pub(crate) strategy: Arc<dyn AssemblyStrategy>,
    pub(crate) lock_timeout: Duration,
    pub(crate) selector: Labels,
}

impl AssemblyOperator {
    /// Operator driven by `strategy`
    pub fn new(context: &OperatorContext, strategy: Arc<dyn AssemblyStrategy>) -> Self {
        Self {
            assembly_type: strategy.assembly_type(),
            config_maps: context.config_maps.clone(),
            secrets: context.secrets.clone(),
            locks: context.locks.clone(),
            authorities: AuthorityManager::new(
                context.secrets.clone(),
                context.locks.clone(),
                context.cert_manager.clone(),
                context.pool.clone(),
                context.lock_timeout,
            ),
            strategy,
            lock_timeout: context.lock_timeout,
            selector: context.selector.clone(),
        }
    }

    /// Operator for `assembly_type` using the model builders
    pub fn for_type(context: &OperatorContext, assembly_type: AssemblyType) -> Self {
        let images = context.images.clone();
        let builder: Arc<dyn AssemblyModelBuilder> = match assembly_type {
            AssemblyType::Kafka => Arc::new(KafkaModelBuilder::new(images)),
            AssemblyType::Connect => Arc::new(ConnectModelBuilder::new(images)),
            AssemblyType::ConnectS2I => Arc::new(ConnectS2IModelBuilder::new(images)),
        };
        let strategy = ModelStrategy::new(
            builder,
            context.operators.clone(),
            MemberIssuer::new(context.cert_manager.clone(), context.pool.clone()),
            context.selector.clone(),
        );
        Self::new(context, Arc::new(strategy))
    }

    /// Assembly type handled
    pub fn assembly_type(&self) -> AssemblyType {
        self.assembly_type
    }

    /// Run one pass for one assembly
    ///
    /// Holds the assembly lock for the whole pass. Fails with
    /// [`Error::LockTimeout`] if another pass for the same assembly holds it
    /// past the timeout; no retry is scheduled.
    #[instrument(skip_all, fields(reconciliation = %reconciliation))]
    pub async fn reconcile_assembly(
        &self,
        reconciliation: &Reconciliation,
    ) -> Result<AssemblyOutcome> {
        let lock_name = reconciliation.lock_name();
        debug!(phase = %Phase::LockPending, lock = %lock_name, "acquiring lock");
        let lock = match self.locks.acquire(&lock_name, self.lock_timeout).await {
            Ok(lock) => lock,
            Err(e) => {
                log_failure(reconciliation, &e);
                return Err(e);
            }
        };
        debug!(phase = %Phase::Locked, lock = %lock_name, "lock acquired");

        let result = self.run_locked(reconciliation).await;

        if let Err(e) = lock.release().await {
            warn!(lock = %lock_name, error = %e, "failed to release lock");
        }
        debug!(phase = %Phase::Released, success = result.is_ok(), "pass finished");

        match &result {
            Ok(AssemblyOutcome::CreatedOrUpdated(report)) => info!(
                reconciliation = %reconciliation,
                resources = report.actions.len(),
                noop = report.is_noop(),
                "assembly reconciled"
            ),
            Ok(AssemblyOutcome::Deleted(report)) => info!(
                reconciliation = %reconciliation,
                resources = report.actions.len(),
                "assembly deleted"
            ),
            Err(e) => log_failure(reconciliation, e),
        }
        result
    }

    async fn run_locked(&self, reconciliation: &Reconciliation) -> Result<AssemblyOutcome> {
        let namespace = reconciliation.namespace();
        let name = reconciliation.name();

        let Some(config) = self.config_maps.get(namespace, name).await? else {
            info!(reconciliation = %reconciliation, "deleting assembly");
            debug!(phase = %Phase::Applying, mode = "delete");
            let report = self.strategy.delete(reconciliation).await?;
            return Ok(AssemblyOutcome::Deleted(report));
        };

        info!(reconciliation = %reconciliation, "creating or updating assembly");
        debug!(phase = %Phase::CertificatePhase);
        let authorities = self.authorities.ensure_authorities(namespace).await?;
        let secrets = self
            .secrets
            .list(
                namespace,
                &Labels::for_cluster(name).with_type(self.assembly_type),
            )
            .await?;

        debug!(phase = %Phase::DiffPhase);
        let plans = self
            .strategy
            .plan(
                reconciliation,
                &config,
                &Credentials {
                    authorities,
                    secrets,
                },
            )
            .await?;

        debug!(phase = %Phase::Applying, mode = "apply", resources = plans.len());
        let report = self.strategy.apply(reconciliation, plans).await?;
        Ok(AssemblyOutcome::CreatedOrUpdated(report))
    }
}

fn log_failure(reconciliation: &Reconciliation, e: &Error) {
    match e.kind() {
        FailureKind::InvalidConfiguration => warn!(
            reconciliation = %reconciliation,
            error = %e,
            "invalid configuration, fix the cluster resource"
        ),
        FailureKind::LockTimeout => warn!(
            reconciliation = %reconciliation,
            error = %e,
            "lock not acquired, the next trigger will retry"
        ),
        FailureKind::PlatformFailure => error!(
            reconciliation = %reconciliation,
            error = %e,
            "reconciliation failed"
        ),
    }
}
