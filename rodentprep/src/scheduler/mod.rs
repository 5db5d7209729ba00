//! Resource-bounded parallel execution of a step graph.
//!
//! This module provides:
//! - A reservation pool enforcing the `nprocs`/`omp_nthreads` budget
//! - Per-run step state and the crash policy
//! - The executor that admits, runs and commits steps

mod executor;
mod pool;
mod state;

pub use executor::{validate_budget, ExecutionSummary, Executor, ExecutorOptions};
pub use pool::{Reservation, ResourcePool};
pub use state::{CrashPolicy, RunState, StepRecord};
