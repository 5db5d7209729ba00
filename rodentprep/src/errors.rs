//! Error types for the rodentprep engine.
//!
//! Graph and budget errors are build-time failures: they abort a run before
//! any step executes. Step errors are run-time failures: they are recorded in
//! the artifact store and the run report, never raised through the
//! coordinator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The step graph is structurally invalid.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A step can never fit within the configured budget.
    #[error("{0}")]
    ResourceBudget(#[from] ResourceBudgetError),

    /// The artifact store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The input dataset could not be used to build a workflow.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// An external input could not be read while fingerprinting.
    #[error("Cannot read external input {}: {source}", .path.display())]
    ExternalInput {
        /// The file or directory that failed.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while assembling a [`crate::graph::Graph`].
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// The dependency edges form a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// A step references an artifact that no step produces.
    #[error("{0}")]
    DanglingReference(#[from] DanglingReferenceError),

    /// Two steps share the same name.
    #[error("Duplicate step name '{name}'")]
    DuplicateStep {
        /// The repeated name.
        name: String,
    },

    /// A step declares the same output twice.
    #[error("Step '{step}' declares output '{output}' more than once")]
    DuplicateOutput {
        /// The step name.
        step: String,
        /// The repeated output name.
        output: String,
    },
}

/// Error raised when the step graph contains a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cycle detected in workflow: {}", cycle.join(" -> "))]
pub struct CycleError {
    /// The steps forming the cycle; the first step is repeated at the end.
    pub cycle: Vec<String>,
}

impl CycleError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle: Vec<String>) -> Self {
        Self { cycle }
    }
}

/// Error raised when a step input references an artifact nobody produces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Step '{step}' references '{producer}.{artifact}' which is not produced by any step")]
pub struct DanglingReferenceError {
    /// The consuming step.
    pub step: String,
    /// The referenced producer step.
    pub producer: String,
    /// The referenced artifact name.
    pub artifact: String,
}

impl DanglingReferenceError {
    /// Creates a new dangling reference error.
    #[must_use]
    pub fn new(
        step: impl Into<String>,
        producer: impl Into<String>,
        artifact: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            producer: producer.into(),
            artifact: artifact.into(),
        }
    }
}

/// Error raised when a step's resource request can never be satisfied.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Step '{step}' requests {requested} {resource} but the budget allows at most {limit}")]
pub struct ResourceBudgetError {
    /// The offending step.
    pub step: String,
    /// Which resource is over budget (`cpu_threads`, `omp_nthreads`, `mem_gb`).
    pub resource: &'static str,
    /// The requested amount.
    pub requested: f64,
    /// The budget limit.
    pub limit: f64,
}

/// Why a step ended in the failed state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// The action itself reported an error.
    #[error("{0}")]
    Action(StepActionError),

    /// The action succeeded but a declared output is absent.
    #[error("{0}")]
    MissingOutput(MissingOutputError),

    /// A dependency failed, so the step was never invoked.
    #[error("Upstream step '{upstream}' failed")]
    Upstream {
        /// The failed ancestor that caused this failure.
        upstream: String,
    },
}

impl StepError {
    /// Returns true if the step's own action ran and failed.
    #[must_use]
    pub fn is_own_failure(&self) -> bool {
        !matches!(self, Self::Upstream { .. })
    }
}

/// An error reported by a step action.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Step '{step}' failed: {message}")]
pub struct StepActionError {
    /// The step name.
    pub step: String,
    /// The failure message.
    pub message: String,
}

impl StepActionError {
    /// Creates a new step action error.
    #[must_use]
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// A declared output was missing after the action completed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Step '{step}' did not produce declared output '{artifact}'{}", path.as_ref().map(|p| format!(" (expected at {})", p.display())).unwrap_or_default())]
pub struct MissingOutputError {
    /// The step name.
    pub step: String,
    /// The missing artifact.
    pub artifact: String,
    /// The path that was expected to exist, if the action reported one.
    pub path: Option<PathBuf>,
}

/// Errors raised by an artifact store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error while reading or writing an entry.
    #[error("Store IO error at {path}: {source}")]
    Io {
        /// The entry path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be (de)serialized.
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Cannot read config file {path}: {source}")]
    Io {
        /// The config path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid YAML for the expected schema.
    #[error("Cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
