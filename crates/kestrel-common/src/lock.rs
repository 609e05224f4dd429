//! Named, timed mutual exclusion for assemblies
//!
//! Reconciliations of one assembly are serialized by acquiring the lock
//! named after its identity (see [`crate::AssemblyIdentity::lock_name`]).
//! Acquisition suspends only the calling task. Two implementations exist:
//!
//! - [`InMemoryLockService`]: a keyed table of async mutexes, for a single
//!   controller instance.
//! - [`LeaseLockService`]: `coordination.k8s.io/v1` Leases with
//!   resourceVersion compare-and-swap, safe across controller instances.
//!   A held Lease is renewed in the background until released.
//!
//! # Release
//!
//! Call [`AssemblyLock::release`] on every exit path. Dropping an unreleased
//! lock still frees it (in the background for leases), so a panic mid-pass
//! cannot wedge an assembly until the lease expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Interval between Lease acquisition attempts
const LEASE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Prefix of Lease names backing assembly locks
const LEASE_NAME_PREFIX: &str = "kestrel-lock";

/// Hex digits of the lock name digest appended to Lease names
const LEASE_NAME_DIGEST_LEN: usize = 10;

/// Longest valid Lease name
const MAX_LEASE_NAME_LEN: usize = 253;

/// Acquires named locks with a timeout
#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait up to `timeout` for the lock called `name`
    ///
    /// Fails with [`Error::LockTimeout`] if the lock is still held when the
    /// timeout elapses.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<AssemblyLock>;
}

/// Implementation-specific handle of a held lock
#[async_trait]
pub trait HeldLock: Send + Sync {
    /// Free the lock
    async fn release(self: Box<Self>) -> Result<()>;

    /// Free the lock without waiting; used when a lock is dropped unreleased
    fn release_detached(self: Box<Self>);
}

/// A held assembly lock
pub struct AssemblyLock {
    name: String,
    held: Option<Box<dyn HeldLock>>,
}

impl AssemblyLock {
    /// Wrap an implementation handle
    pub fn new(name: impl Into<String>, held: Box<dyn HeldLock>) -> Self {
        Self {
            name: name.into(),
            held: Some(held),
        }
    }

    /// Name the lock was acquired under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free the lock
    pub async fn release(mut self) -> Result<()> {
        match self.held.take() {
            Some(held) => {
                let result = held.release().await;
                debug!(lock = %self.name, "lock released");
                result
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AssemblyLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyLock")
            .field("name", &self.name)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl Drop for AssemblyLock {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            warn!(lock = %self.name, "lock dropped without release, releasing in background");
            held.release_detached();
        }
    }
}

// =============================================================================
// In-memory lock table
// =============================================================================

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Keyed table of async mutexes for single-instance deployments
///
/// Entries exist only while a lock is held or awaited.
#[derive(Default)]
pub struct InMemoryLockService {
    locks: LockTable,
}

impl InMemoryLockService {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named lock is currently held
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// True if no lock is held or awaited
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

struct LocalGuard {
    name: String,
    guard: OwnedMutexGuard<()>,
    table: LockTable,
}

impl LocalGuard {
    fn unlock(self) {
        let LocalGuard { name, guard, table } = self;
        drop(guard);
        // The table holds one reference; any other is a waiter
        table.remove_if(&name, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[async_trait]
impl HeldLock for LocalGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        (*self).unlock();
        Ok(())
    }

    fn release_detached(self: Box<Self>) {
        (*self).unlock();
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<AssemblyLock> {
        // Clone the Arc out so the map shard isn't held across the await
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!(lock = %name, "lock acquired");
                let held = LocalGuard {
                    name: name.to_string(),
                    guard,
                    table: Arc::clone(&self.locks),
                };
                Ok(AssemblyLock::new(name, Box::new(held)))
            }
            Err(_) => {
                // The timed-out future dropped its reference already
                self.locks.remove_if(name, |_, m| Arc::strong_count(m) == 1);
                Err(Error::lock_timeout(name, timeout.as_millis() as u64))
            }
        }
    }
}

// =============================================================================
// Lease-backed lock
// =============================================================================

/// Distributed lock table backed by Kubernetes Leases
///
/// Each lock is a Lease in the namespace named by the lock (the second
/// `::`-separated segment), falling back to `default_namespace` for names
/// that don't follow the `lock::<namespace>::...` pattern. Every acquisition
/// gets its own holder identity so tasks in one process contend too.
pub struct LeaseLockService {
    client: Client,
    identity: String,
    default_namespace: String,
    retry_interval: Duration,
    acquisitions: AtomicU64,
}

impl LeaseLockService {
    /// Create a lease lock service; `identity` should be unique per instance (e.g. pod name)
    pub fn new(client: Client, identity: &str, default_namespace: &str) -> Self {
        Self {
            client,
            identity: identity.to_string(),
            default_namespace: default_namespace.to_string(),
            retry_interval: LEASE_RETRY_INTERVAL,
            acquisitions: AtomicU64::new(0),
        }
    }

    fn holder_identity(&self) -> String {
        let n = self.acquisitions.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.identity, n)
    }
}

/// Namespace and Lease name backing a lock name
///
/// `lock::test::kafka::my-cluster` maps to Lease
/// `kestrel-lock-kafka-my-cluster-<digest>` in namespace `test`. The digest
/// covers the whole lock name, so names that sanitise to the same text
/// still get distinct Leases.
pub fn lease_location(lock_name: &str, default_namespace: &str) -> (String, String) {
    let segments: Vec<&str> = lock_name.split("::").collect();
    let (namespace, rest) = match segments.as_slice() {
        ["lock", ns, rest @ ..] if !ns.is_empty() && !rest.is_empty() => (ns.to_string(), rest),
        _ => (default_namespace.to_string(), &segments[..]),
    };

    let mut name = String::from(LEASE_NAME_PREFIX);
    for segment in rest {
        name.push('-');
        name.extend(segment.chars().map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        }));
    }
    name.truncate(MAX_LEASE_NAME_LEN - LEASE_NAME_DIGEST_LEN - 1);
    let mut name = name.trim_end_matches(['-', '.']).to_string();

    let digest = format!("{:x}", Sha256::digest(lock_name.as_bytes()));
    name.push('-');
    name.push_str(&digest[..LEASE_NAME_DIGEST_LEN]);
    (namespace, name)
}

/// Whole seconds a Lease lasts for a lock held with `timeout`
fn lease_seconds(timeout: Duration) -> i32 {
    timeout.as_secs().clamp(1, i32::MAX as u64) as i32
}

/// How often a held Lease is renewed; three renewals fit in one lease term
fn renew_interval(lease_seconds: i32) -> Duration {
    Duration::from_secs(lease_seconds.max(1) as u64) / 3
}

fn lease_expired(spec: Option<&LeaseSpec>, now: chrono::DateTime<Utc>) -> bool {
    let holder = spec.and_then(|s| s.holder_identity.as_ref());
    if holder.is_none() {
        return true;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

struct LeaseAttempt<'a> {
    api: &'a Api<Lease>,
    namespace: &'a str,
    lease_name: &'a str,
    holder: &'a str,
    lease_duration: Duration,
}

impl LeaseAttempt<'_> {
    /// Try to take the lease once; Ok(false) means someone else holds it
    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();

        let existing = match self.api.get(self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let (resource_version, transitions) = match existing {
            None => return self.create(now).await,
            Some(lease) => {
                let spec = lease.spec.as_ref();
                if !lease_expired(spec, now) {
                    return Ok(false);
                }
                (
                    lease.metadata.resource_version.clone(),
                    spec.and_then(|s| s.lease_transitions).unwrap_or(0),
                )
            }
        };

        let lease = self.lease(now, resource_version, transitions + 1);
        match self
            .api
            .replace(self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, now: chrono::DateTime<Utc>) -> Result<bool> {
        let lease = self.lease(now, None, 0);
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lease(
        &self,
        now: chrono::DateTime<Utc>,
        resource_version: Option<String>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.to_string()),
                namespace: Some(self.namespace.to_string()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.to_string()),
                lease_duration_seconds: Some(lease_seconds(self.lease_duration)),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl LockService for LeaseLockService {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<AssemblyLock> {
        let (namespace, lease_name) = lease_location(name, &self.default_namespace);
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        let holder = self.holder_identity();
        let attempt = LeaseAttempt {
            api: &api,
            namespace: &namespace,
            lease_name: &lease_name,
            holder: &holder,
            lease_duration: timeout,
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match attempt.try_acquire().await {
                Ok(true) => {
                    debug!(lock = %name, lease = %lease_name, holder = %holder, "lock acquired");
                    let held = LeaseGuard::start(
                        api.clone(),
                        lease_name.clone(),
                        holder.clone(),
                        renew_interval(lease_seconds(timeout)),
                    );
                    return Ok(AssemblyLock::new(name, Box::new(held)));
                }
                Ok(false) => {}
                Err(e) => {
                    // Transient API errors shouldn't end the wait early
                    warn!(lock = %name, error = %e, "lease acquisition attempt failed");
                }
            }
            if tokio::time::Instant::now() + self.retry_interval > deadline {
                return Err(Error::lock_timeout(name, timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// A held Lease and the task keeping it renewed
struct LeaseGuard {
    api: Api<Lease>,
    lease_name: String,
    holder: String,
    renewal: JoinHandle<()>,
}

impl LeaseGuard {
    fn start(api: Api<Lease>, lease_name: String, holder: String, interval: Duration) -> Self {
        let renewal = tokio::spawn(renewal_loop(
            api.clone(),
            lease_name.clone(),
            holder.clone(),
            interval,
        ));
        Self {
            api,
            lease_name,
            holder,
            renewal,
        }
    }

    /// Clear the holder if we still hold the lease
    async fn clear_holder(&self) -> Result<()> {
        let mut lease = match self.api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.holder) {
            debug!(lease = %self.lease_name, "lease no longer ours, nothing to release");
            return Ok(());
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(()),
            // Changed under us: it expired and someone else took it
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

/// Push the renew time forward until the lease is lost or the task is aborted
async fn renewal_loop(api: Api<Lease>, lease_name: String, holder: String, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let lease = match api.get(&lease_name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(lease = %lease_name, error = %e, "failed to read lease for renewal");
                continue;
            }
        };
        let Some(lease) = renewed(lease, &holder, Utc::now()) else {
            warn!(lease = %lease_name, holder = %holder, "lease lost, renewal stopped");
            return;
        };
        match api
            .replace(&lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => debug!(lease = %lease_name, "lease renewed"),
            // Raced with another writer; the next round re-reads
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => warn!(lease = %lease_name, error = %e, "lease renewal failed"),
        }
    }
}

/// `lease` with its renew time set to `now`, if `holder` still holds it
fn renewed(mut lease: Lease, holder: &str, now: chrono::DateTime<Utc>) -> Option<Lease> {
    let spec = lease.spec.as_mut()?;
    if spec.holder_identity.as_deref() != Some(holder) {
        return None;
    }
    spec.renew_time = Some(MicroTime(now));
    Some(lease)
}

#[async_trait]
impl HeldLock for LeaseGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        self.renewal.abort();
        self.clear_holder().await
    }

    fn release_detached(self: Box<Self>) {
        self.renewal.abort();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = self.clear_holder().await {
                        warn!(lease = %self.lease_name, error = %e, "background lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(lease = %self.lease_name, "no runtime to release lease, it will expire");
            }
        }
    }
}
