//! Step lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The scheduling state of a step within one run.
///
/// Steps move `Pending -> Ready -> Running -> {Done, Failed}`. A step
/// resolved from the cache goes straight from `Pending` to `Done`, and a
/// step whose ancestor failed goes straight from `Pending` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// All dependencies are done; waiting for a resource slot.
    Ready,
    /// The action is executing.
    Running,
    /// Completed successfully (either executed or resolved from cache).
    Done,
    /// The action failed, an output was missing, or an ancestor failed.
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if the step is still waiting to be admitted.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}
