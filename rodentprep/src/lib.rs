//! # Rodentprep
//!
//! A cached, resource-bounded workflow engine for rodent MRI preprocessing.
//!
//! Rodentprep runs a directed acyclic graph of steps with support for:
//!
//! - **Content-addressed caching**: a step whose fingerprint matches a stored
//!   success is not re-run, across invocations
//! - **Resource-bounded scheduling**: concurrently running steps never use
//!   more than `nprocs` threads, and no step more than `omp_nthreads`
//! - **Crash policies**: stop on the first failure or keep independent
//!   branches running
//! - **Preprocessing workflow**: BIDS discovery and the anatomical and
//!   functional step graph
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rodentprep::prelude::*;
//!
//! let graph = GraphBuilder::new()
//!     .step(Step::new("brain_extraction", Arc::new(bet))
//!         .with_external_input("anat", "sub-01_T2w.nii.gz")
//!         .with_output(ArtifactDescriptor::file("brain"))
//!         .with_resources(ResourceRequest::threads(4)))
//!     .step(Step::new("anat_norm", Arc::new(norm))
//!         .with_input_from("brain", "brain_extraction", "brain")
//!         .with_output(ArtifactDescriptor::file("standardized")))
//!     .build()?;
//!
//! let coordinator = RunCoordinator::open(RunOptions::new("work", Budget::new(8, 4))).await?;
//! let report = coordinator.run(&graph).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod graph;
pub mod observability;
pub mod scheduler;
pub mod steps;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod workflows;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, ExecutionConfig, ToolConfig};
    pub use crate::coordinator::{
        RunCoordinator, RunOptions, RunReport, RunStatus, StepOutcome, StepReport,
    };
    pub use crate::core::{
        ArtifactDescriptor, ArtifactKind, ArtifactMap, ArtifactValue, Budget, ResourceRequest,
        StepStatus,
    };
    pub use crate::errors::{
        CycleError, DanglingReferenceError, EngineError, GraphError, MissingOutputError,
        ResourceBudgetError, StepActionError, StepError,
    };
    pub use crate::graph::{Graph, GraphBuilder, StepId};
    pub use crate::scheduler::CrashPolicy;
    pub use crate::steps::{ActionContext, FnAction, Fingerprint, HashMethod, Step, StepAction};
    pub use crate::store::{ArtifactStore, CacheEntry, FsArtifactStore, InMemoryArtifactStore};
}
