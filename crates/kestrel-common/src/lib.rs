//! Common types for kestrel: errors, labels, assembly identities, locks

#![deny(missing_docs)]

pub mod error;
pub mod labels;
pub mod lock;
pub mod reconciliation;
pub mod worker;

pub use error::{Error, FailureKind};
pub use labels::Labels;
pub use lock::{AssemblyLock, InMemoryLockService, LeaseLockService, LockService};
pub use reconciliation::{AssemblyIdentity, AssemblyType, Reconciliation};
pub use worker::WorkerPool;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default assembly lock acquisition timeout
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 60_000;

/// Default periodic re-sync interval
pub const DEFAULT_FULL_RECONCILIATION_INTERVAL_MS: u64 = 120_000;

/// Default size of the blocking worker pool
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kestrel-operator";
