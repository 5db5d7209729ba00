//! Run coordination: one invocation from graph to report.
//!
//! The coordinator validates the graph against the budget, fingerprints
//! every step, hands the graph to the executor and turns the resulting
//! state into a [`RunReport`].

pub mod cleanup;
mod report;


pub use report::{RunReport, RunStatus, StepOutcome, StepReport};

use crate::cancellation::CancellationToken;
use crate::core::Budget;
use crate::errors::{EngineError, StepError};
use crate::graph::Graph;
use crate::scheduler::{validate_budget, CrashPolicy, Executor, ExecutorOptions};
use crate::steps::{fingerprint_graph, HashMethod};
use crate::store::{ArtifactStore, FsArtifactStore};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, Instrument};

/// Settings for one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory holding the cache, step outputs and reports.
    pub work_dir: PathBuf,
    /// The resource ceiling.
    pub budget: Budget,
    /// What to do after a failure.
    pub crash_policy: CrashPolicy,
    /// How external inputs are digested.
    pub hash_method: HashMethod,
    /// Longest idle wait between ready-queue checks.
    pub poll_sleep: Duration,
    /// License file passed through to actions.
    pub license_file: Option<PathBuf>,
    /// Whether to write the report under `<work_dir>/reports`.
    pub persist_report: bool,
}

impl RunOptions {
    /// Creates options with the default policies.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>, budget: Budget) -> Self {
        Self {
            work_dir: work_dir.into(),
            budget,
            crash_policy: CrashPolicy::default(),
            hash_method: HashMethod::default(),
            poll_sleep: Duration::from_millis(500),
            license_file: None,
            persist_report: true,
        }
    }

    /// Sets the crash policy.
    #[must_use]
    pub fn with_crash_policy(mut self, crash_policy: CrashPolicy) -> Self {
        self.crash_policy = crash_policy;
        self
    }

    /// Sets the hash method.
    #[must_use]
    pub fn with_hash_method(mut self, hash_method: HashMethod) -> Self {
        self.hash_method = hash_method;
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn with_poll_sleep(mut self, poll_sleep: Duration) -> Self {
        self.poll_sleep = poll_sleep;
        self
    }

    /// Sets the license file.
    #[must_use]
    pub fn with_license_file(mut self, license_file: Option<PathBuf>) -> Self {
        self.license_file = license_file;
        self
    }

    /// Enables or disables report persistence.
    #[must_use]
    pub fn with_persist_report(mut self, persist_report: bool) -> Self {
        self.persist_report = persist_report;
        self
    }

    /// Directory of the per-step output directories.
    #[must_use]
    pub fn steps_dir(&self) -> PathBuf {
        self.work_dir.join("steps")
    }

    /// Directory of persisted reports.
    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.work_dir.join("reports")
    }

    fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions::new(self.budget, self.steps_dir())
            .with_crash_policy(self.crash_policy)
            .with_poll_sleep(self.poll_sleep)
            .with_license_file(self.license_file.clone())
    }
}

/// Runs graphs against one artifact store.
#[derive(Debug)]
pub struct RunCoordinator {
    options: RunOptions,
    store: Arc<dyn ArtifactStore>,
    cancel: Arc<CancellationToken>,
}

impl RunCoordinator {
    /// Creates a coordinator over an existing store.
    #[must_use]
    pub fn new(options: RunOptions, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            options,
            store,
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Creates a coordinator over the filesystem store in the working
    /// directory.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened.
    pub async fn open(options: RunOptions) -> Result<Self, EngineError> {
        let store = FsArtifactStore::in_work_dir(&options.work_dir).await?;
        Ok(Self::new(options, Arc::new(store)))
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Runs `graph` to completion.
    ///
    /// Step failures are reported, never raised.
    ///
    /// # Errors
    ///
    /// Fails before any step runs if a step exceeds the budget or an
    /// external input cannot be read, or afterwards if the report cannot
    /// be written.
    pub async fn run(&self, graph: &Graph) -> Result<RunReport, EngineError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let span = info_span!("run", steps = graph.len());

        async {
            validate_budget(graph, &self.options.budget)?;
            let fingerprints = fingerprint_graph(graph, self.options.hash_method).await?;

            let summary = Executor::new(self.options.executor_options(), self.store.clone())
                .with_cancellation(self.cancel.clone())
                .execute(graph, &fingerprints)
                .await?;

            let dirs: Vec<PathBuf> = summary
                .state
                .records()
                .iter()
                .filter(|r| r.error.as_ref().is_some_and(StepError::is_own_failure))
                .filter_map(|r| r.output_dir.clone())
                .collect();
            let indeterminate = tokio::task::spawn_blocking(move || report::collect_indeterminate(&dirs))
                .await
                .map_err(|e| EngineError::Internal(format!("cleanup scan join error: {e}")))?;

            let report = RunReport::from_execution(graph, &fingerprints, &summary, started_at, started.elapsed())
                .with_indeterminate(indeterminate);

            info!(
                run_id = %report.run_id,
                status = ?report.status,
                executed = report.executed().len(),
                cached = report.cached().len(),
                failed = report.failed().len(),
                not_run = report.not_run().len(),
                "Run finished"
            );

            if self.options.persist_report {
                let path = report.persist(&self.options.reports_dir()).await?;
                info!(path = %path.display(), "Wrote run report");
            }
            Ok::<_, EngineError>(report)
        }
        .instrument(span)
        .await
    }
}
