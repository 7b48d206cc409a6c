//! Bounded-concurrency execution of build action graphs.
//!
//! A finished [`ActionGraph`] is validated, then either handed to a remote
//! accelerator through the [`OffloadAdapter`] or run on this host by the
//! [`Scheduler`], which admits ready actions against a slot, weight and
//! memory budget and runs each one as an external process.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod limits;
    pub mod memory;
}

pub mod exec;
pub mod executor;
pub mod graph;
pub mod offload;
pub mod report;
pub mod scheduler;

// Re-exports for convenience
pub use crate::core::config::{DispatchMode, ExecutorConfig, OffloadConfig};
pub use crate::core::errors::{BuildError, GraphError, Result};
pub use crate::core::limits::{AdmissionController, AdmissionLimits, AdmissionState};
pub use crate::core::memory::{FixedMemory, MemoryProbe, SystemMemory};
pub use exec::{ActionRunner, ExecutionResult, ProcessExecutor};
pub use executor::BuildExecutor;
pub use graph::{Action, ActionGraph, ActionId, ActionState, GraphSpec};
pub use offload::{OffloadAdapter, ResourceBroker, ResourceGrant};
pub use report::{ActionRecord, ExecutionMode, Report};
pub use scheduler::{ActionObserver, ArtifactCache, Phase, Scheduler};
