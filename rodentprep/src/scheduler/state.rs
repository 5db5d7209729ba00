//! Per-invocation run state and crash policy.

use crate::core::{ArtifactMap, Budget, StepStatus};
use crate::errors::StepError;
use crate::graph::StepId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// How the run reacts to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPolicy {
    /// Stop admitting steps after the first failure and let running steps
    /// drain.
    #[default]
    StopOnFirstCrash,
    /// Keep running every branch that does not depend on a failed step.
    ContinueIndependent,
}

impl CrashPolicy {
    /// Maps the `stop_on_first_crash` configuration flag.
    #[must_use]
    pub fn from_stop_on_first_crash(stop: bool) -> Self {
        if stop {
            Self::StopOnFirstCrash
        } else {
            Self::ContinueIndependent
        }
    }

    /// Returns true if a failure halts admission.
    #[must_use]
    pub fn stops_on_failure(&self) -> bool {
        matches!(self, Self::StopOnFirstCrash)
    }
}

/// What the run knows about one step.
#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    /// Current status.
    pub status: StepStatus,
    /// True if the result came from the artifact store.
    pub cached: bool,
    /// Why the step failed.
    pub error: Option<StepError>,
    /// Artifacts produced (or resolved from cache).
    pub outputs: ArtifactMap,
    /// Where the action wrote its files.
    pub output_dir: Option<PathBuf>,
    /// Wall time spent running the action.
    pub wall_time: Duration,
    pub(crate) cache_checked: bool,
}

/// Mutable state of one invocation.
#[derive(Debug, Clone)]
pub struct RunState {
    records: Vec<StepRecord>,
    /// The crash policy in force.
    pub crash_policy: CrashPolicy,
    /// The resource budget in force.
    pub budget: Budget,
    stopped: bool,
    cancelled: bool,
}

impl RunState {
    /// Creates a state with every step pending.
    #[must_use]
    pub fn new(steps: usize, crash_policy: CrashPolicy, budget: Budget) -> Self {
        Self {
            records: vec![StepRecord::default(); steps],
            crash_policy,
            budget,
            stopped: false,
            cancelled: false,
        }
    }

    /// Returns the record of a step.
    #[must_use]
    pub fn record(&self, id: StepId) -> &StepRecord {
        &self.records[id]
    }

    /// Returns all records, indexed by step id.
    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Returns the status of a step.
    #[must_use]
    pub fn status(&self, id: StepId) -> StepStatus {
        self.records[id].status
    }

    fn ids_with(&self, status: StepStatus) -> BTreeSet<StepId> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id)
            .collect()
    }

    /// Steps waiting on dependencies.
    #[must_use]
    pub fn pending(&self) -> BTreeSet<StepId> {
        self.ids_with(StepStatus::Pending)
    }

    /// Steps waiting on a resource slot.
    #[must_use]
    pub fn ready(&self) -> BTreeSet<StepId> {
        self.ids_with(StepStatus::Ready)
    }

    /// Steps currently executing.
    #[must_use]
    pub fn running(&self) -> BTreeSet<StepId> {
        self.ids_with(StepStatus::Running)
    }

    /// Steps that completed successfully.
    #[must_use]
    pub fn done(&self) -> BTreeSet<StepId> {
        self.ids_with(StepStatus::Done)
    }

    /// Steps that failed, directly or through an ancestor.
    #[must_use]
    pub fn failed(&self) -> BTreeSet<StepId> {
        self.ids_with(StepStatus::Failed)
    }

    pub(crate) fn done_set(&self) -> HashSet<StepId> {
        self.done().into_iter().collect()
    }

    /// Steps that must not appear in the ready frontier again.
    pub(crate) fn claimed_set(&self) -> HashSet<StepId> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r.status, StepStatus::Running | StepStatus::Failed))
            .map(|(id, _)| id)
            .collect()
    }

    pub(crate) fn mark_ready(&mut self, id: StepId) {
        if self.records[id].status == StepStatus::Pending {
            self.records[id].status = StepStatus::Ready;
        }
    }

    pub(crate) fn mark_cache_checked(&mut self, id: StepId) -> bool {
        std::mem::replace(&mut self.records[id].cache_checked, true)
    }

    pub(crate) fn mark_running(&mut self, id: StepId, output_dir: PathBuf) {
        let record = &mut self.records[id];
        record.status = StepStatus::Running;
        record.output_dir = Some(output_dir);
    }

    pub(crate) fn mark_cached(&mut self, id: StepId, outputs: ArtifactMap) {
        let record = &mut self.records[id];
        record.status = StepStatus::Done;
        record.cached = true;
        record.outputs = outputs;
    }

    pub(crate) fn mark_done(&mut self, id: StepId, outputs: ArtifactMap, wall_time: Duration) {
        let record = &mut self.records[id];
        record.status = StepStatus::Done;
        record.outputs = outputs;
        record.wall_time = wall_time;
    }

    pub(crate) fn mark_failed(&mut self, id: StepId, error: StepError, wall_time: Duration) {
        let record = &mut self.records[id];
        record.status = StepStatus::Failed;
        record.error = Some(error);
        record.wall_time = wall_time;
    }

    pub(crate) fn stop(&mut self) {
        self.stopped = true;
    }

    pub(crate) fn cancel(&mut self) {
        self.stopped = true;
        self.cancelled = true;
    }

    /// Returns true once admission has been halted.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Returns true if the run was cancelled from outside.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns true if every step reached a terminal status.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.records.iter().all(|r| r.status.is_terminal())
    }
}
