//! The run report: the single record of what succeeded, failed or never ran.

use crate::core::{Budget, StepStatus};
use crate::errors::{EngineError, StepError};
use crate::graph::Graph;
use crate::scheduler::ExecutionSummary;
use crate::steps::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step is done.
    Success,
    /// At least one step failed.
    Failed,
    /// The run was interrupted.
    Cancelled,
}

/// How a step reached its terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The action ran and succeeded.
    Executed,
    /// The result came from the artifact store.
    Cached,
    /// The action failed, or an upstream step did.
    Failed,
    /// The step was never attempted.
    NotRun,
}

/// Report line for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// The step name.
    pub name: String,
    /// The step fingerprint.
    pub fingerprint: Fingerprint,
    /// Terminal status (or `pending`/`ready` if never attempted).
    pub status: StepStatus,
    /// How the status was reached.
    pub outcome: StepOutcome,
    /// Wall time spent in the action.
    pub wall_time_ms: u64,
    /// Why the step failed.
    pub error: Option<StepError>,
    /// Where the action wrote its files.
    pub output_dir: Option<PathBuf>,
}

/// Report for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run id.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Total run time.
    pub duration_ms: u64,
    /// Overall outcome.
    pub status: RunStatus,
    /// The budget the run used.
    pub budget: Budget,
    /// Highest number of threads reserved at once.
    pub peak_cpu_threads: usize,
    /// Per-step lines, in declaration order.
    pub steps: Vec<StepReport>,
    /// Files left behind by failed steps. They have no cache entry and must
    /// not be mistaken for complete results.
    pub indeterminate: Vec<PathBuf>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl RunReport {
    /// Builds a report from an execution.
    #[must_use]
    pub fn from_execution(
        graph: &Graph,
        fingerprints: &[Fingerprint],
        summary: &ExecutionSummary,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let state = &summary.state;
        let steps: Vec<StepReport> = graph
            .steps()
            .iter()
            .enumerate()
            .map(|(id, step)| {
                let record = state.record(id);
                let outcome = match record.status {
                    StepStatus::Done if record.cached => StepOutcome::Cached,
                    StepStatus::Done => StepOutcome::Executed,
                    StepStatus::Failed => StepOutcome::Failed,
                    _ => StepOutcome::NotRun,
                };
                StepReport {
                    name: step.name.clone(),
                    fingerprint: fingerprints[id].clone(),
                    status: record.status,
                    outcome,
                    wall_time_ms: millis(record.wall_time),
                    error: record.error.clone(),
                    output_dir: record.output_dir.clone(),
                }
            })
            .collect();

        let status = if state.is_cancelled() {
            RunStatus::Cancelled
        } else if steps.iter().all(|s| s.status == StepStatus::Done) {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        Self {
            run_id: Uuid::new_v4(),
            started_at,
            duration_ms: millis(duration),
            status,
            budget: state.budget,
            peak_cpu_threads: summary.peak_cpu_threads,
            steps,
            indeterminate: Vec::new(),
        }
    }

    /// Sets the indeterminate file list.
    #[must_use]
    pub fn with_indeterminate(mut self, indeterminate: Vec<PathBuf>) -> Self {
        self.indeterminate = indeterminate;
        self
    }

    /// Returns the line for a step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn names_with(&self, outcome: StepOutcome) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.outcome == outcome)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Steps whose action ran and succeeded.
    #[must_use]
    pub fn executed(&self) -> Vec<&str> {
        self.names_with(StepOutcome::Executed)
    }

    /// Steps resolved from the cache.
    #[must_use]
    pub fn cached(&self) -> Vec<&str> {
        self.names_with(StepOutcome::Cached)
    }

    /// Steps that failed, directly or through an upstream step.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.names_with(StepOutcome::Failed)
    }

    /// Steps never attempted.
    #[must_use]
    pub fn not_run(&self) -> Vec<&str> {
        self.names_with(StepOutcome::NotRun)
    }

    /// Steps whose own action failed, as opposed to upstream failures.
    pub fn own_failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| s.error.as_ref().is_some_and(StepError::is_own_failure))
    }

    /// Returns true if every step is done.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Process exit status summarising the run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 130,
        }
    }

    /// Writes the report as `<reports_dir>/<run_id>.json`.
    ///
    /// # Errors
    ///
    /// Fails if the directory or file cannot be written.
    pub async fn persist(&self, reports_dir: &Path) -> Result<PathBuf, EngineError> {
        tokio::fs::create_dir_all(reports_dir).await?;
        let path = reports_dir.join(format!("{}.json", self.run_id));
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Internal(format!("cannot serialize report: {e}")))?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// Lists every file under the output directories of steps whose own action
/// failed.
pub(crate) fn collect_indeterminate(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack: Vec<PathBuf> = dirs.to_vec();
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            // Links may point outside the step directory and are left alone.
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(name: &str, status: StepStatus, outcome: StepOutcome) -> StepReport {
        StepReport {
            name: name.to_string(),
            fingerprint: Fingerprint::from_hex(format!("{name}00")),
            status,
            outcome,
            wall_time_ms: 0,
            error: None,
            output_dir: None,
        }
    }

    fn report(status: RunStatus, steps: Vec<StepReport>) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 5,
            status,
            budget: Budget::new(4, 2),
            peak_cpu_threads: 2,
            steps,
            indeterminate: Vec::new(),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(RunStatus::Success, vec![]).exit_code(), 0);
        assert_eq!(report(RunStatus::Failed, vec![]).exit_code(), 1);
        assert_eq!(report(RunStatus::Cancelled, vec![]).exit_code(), 130);
    }

    #[test]
    fn test_outcome_queries() {
        let report = report(
            RunStatus::Failed,
            vec![
                line("anat", StepStatus::Done, StepOutcome::Cached),
                line("bold", StepStatus::Failed, StepOutcome::Failed),
                line("sink", StepStatus::Pending, StepOutcome::NotRun),
            ],
        );

        assert_eq!(report.cached(), vec!["anat"]);
        assert_eq!(report.failed(), vec!["bold"]);
        assert_eq!(report.not_run(), vec!["sink"]);
        assert!(report.executed().is_empty());
        assert_eq!(report.step("bold").unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_persist_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = report(RunStatus::Success, vec![line("anat", StepStatus::Done, StepOutcome::Executed)]);

        let path = report.persist(&dir.path().join("reports")).await.unwrap();

        assert!(path.ends_with(format!("{}.json", report.run_id)));
        let loaded: RunReport = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn test_collect_indeterminate_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/sub")).unwrap();
        std::fs::write(dir.path().join("a/partial.nii.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("a/sub/log.txt"), b"x").unwrap();

        let files = collect_indeterminate(&[dir.path().join("a"), dir.path().join("missing")]);

        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("partial.nii.gz")));
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_indeterminate_skips_links() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/sub")).unwrap();
        std::fs::write(dir.path().join("a/sub/partial.nii"), b"x").unwrap();
        std::fs::write(outside.path().join("input.nii.gz"), b"x").unwrap();
        std::os::unix::fs::symlink("..", dir.path().join("a/sub/loop")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("input.nii.gz"), dir.path().join("a/input.nii.gz"))
            .unwrap();

        let files = collect_indeterminate(&[dir.path().join("a")]);

        assert_eq!(files, vec![dir.path().join("a/sub/partial.nii")]);
    }
}
