//! Dependency graph of steps.
//!
//! This module provides:
//! - A builder that derives edges from declared artifact inputs
//! - Validation (duplicates, dangling references, cycles)
//! - Deterministic topological ordering and the scheduler's ready frontier

mod builder;
mod dag;

pub use builder::GraphBuilder;
pub use dag::{Graph, StepId};
