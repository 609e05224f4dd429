//! Kestrel operator - reconciles Kafka, Kafka Connect and Kafka Connect S2I
//! assemblies described by labelled ConfigMaps
//!
//! A configuration ConfigMap labelled `kestrel.io/kind=cluster` and
//! `kestrel.io/type=<type>` declares one assembly. The operator builds the
//! desired resources for it, diffs them against the live objects, and
//! applies the difference under a per-assembly lock. Removing the
//! configuration deletes everything the assembly owned.

#![deny(missing_docs)]

pub mod assembly;
pub mod batch;
pub mod certificates;
pub mod config;
pub mod diff;
pub mod model;
pub mod resource;
pub mod startup;
pub mod watch;

#[cfg(test)]
mod testing;

pub use assembly::{AssemblyOperator, AssemblyOutcome, OperatorContext};
pub use batch::{BatchHandle, BatchReport};
pub use config::OperatorConfig;
