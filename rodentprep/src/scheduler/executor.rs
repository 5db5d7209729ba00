//! Executes a step graph under resource and dependency constraints.
//!
//! Steps are admitted as soon as every dependency is done and a
//! reservation fits, then run as tokio tasks. Results are committed to the
//! artifact store; failures propagate to descendants.

use super::{CrashPolicy, Reservation, ResourcePool, RunState};
use crate::cancellation::CancellationToken;
use crate::core::{ArtifactMap, ArtifactValue, Budget};
use crate::errors::{EngineError, MissingOutputError, StepActionError, StepError};
use crate::graph::{Graph, StepId};
use crate::steps::{ActionContext, Fingerprint, InputSource, Step};
use crate::store::{ArtifactStore, CacheEntry, CommitOutcome};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

type StepResult = Result<ArtifactMap, StepError>;
type Completion = (StepId, StepResult, Duration);

/// Settings for one execution.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// The resource ceiling.
    pub budget: Budget,
    /// What to do after a failure.
    pub crash_policy: CrashPolicy,
    /// Longest idle wait between ready-queue checks.
    pub poll_sleep: Duration,
    /// Parent of the per-step output directories.
    pub steps_dir: PathBuf,
    /// License file passed through to actions.
    pub license_file: Option<PathBuf>,
}

impl ExecutorOptions {
    /// Creates options with the default crash policy and poll interval.
    #[must_use]
    pub fn new(budget: Budget, steps_dir: impl Into<PathBuf>) -> Self {
        Self {
            budget,
            crash_policy: CrashPolicy::default(),
            poll_sleep: Duration::from_millis(500),
            steps_dir: steps_dir.into(),
            license_file: None,
        }
    }

    /// Sets the crash policy.
    #[must_use]
    pub fn with_crash_policy(mut self, crash_policy: CrashPolicy) -> Self {
        self.crash_policy = crash_policy;
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
}

/// What an execution left behind.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    /// Final per-step state.
    pub state: RunState,
    /// Highest number of threads reserved at once.
    pub peak_cpu_threads: usize,
}

/// Runs a graph against an artifact store.
#[derive(Debug)]
pub struct Executor {
    options: ExecutorOptions,
    store: Arc<dyn ArtifactStore>,
    cancel: Arc<CancellationToken>,
}

/// Checks that every non-inline step could be admitted on an idle pool.
///
/// # Errors
///
/// Returns the first step whose request exceeds the budget.
pub fn validate_budget(graph: &Graph, budget: &Budget) -> Result<(), EngineError> {
    for step in graph.steps().iter().filter(|s| !s.inline) {
        budget.admits(&step.name, &step.resources)?;
    }
    Ok(())
}

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new(options: ExecutorOptions, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            options,
            store,
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes `graph`. `fingerprints` is indexed by step id.
    ///
    /// Step failures are recorded in the returned state, never raised.
    ///
    /// # Errors
    ///
    /// Fails before running anything if a step exceeds the budget or the
    /// fingerprints do not match the graph.
    pub async fn execute(
        &self,
        graph: &Graph,
        fingerprints: &[Fingerprint],
    ) -> Result<ExecutionSummary, EngineError> {
        if fingerprints.len() != graph.len() {
            return Err(EngineError::Internal(format!(
                "{} fingerprints for {} steps",
                fingerprints.len(),
                graph.len()
            )));
        }
        validate_budget(graph, &self.options.budget)?;

        let mut state = RunState::new(graph.len(), self.options.crash_policy, self.options.budget);
        let mut pool = ResourcePool::new(self.options.budget);
        let mut reservations: HashMap<StepId, Reservation> = HashMap::new();
        let mut active: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();

        info!(
            steps = graph.len(),
            nprocs = self.options.budget.nprocs,
            omp_nthreads = self.options.budget.omp_nthreads,
            "Starting execution"
        );

        loop {
            if !state.is_stopped() && self.cancel.is_cancelled() {
                warn!("Run cancelled; draining running steps");
                state.cancel();
            }

            if !state.is_stopped() {
                self.admit(graph, fingerprints, &mut state, &mut pool, &mut reservations, &mut active)
                    .await;
            }

            if active.is_empty() {
                break;
            }

            let completion = tokio::select! {
                next = active.next() => next,
                () = self.cancel.cancelled(), if !state.is_stopped() => None,
                () = tokio::time::sleep(self.options.poll_sleep) => None,
            };

            if let Some((id, result, wall_time)) = completion {
                if let Some(reservation) = reservations.remove(&id) {
                    pool.release(reservation);
                }
                self.finish(graph, fingerprints, &mut state, id, result, wall_time)
                    .await;
            }
        }

        info!(
            done = state.done().len(),
            failed = state.failed().len(),
            not_run = state.pending().len() + state.ready().len(),
            peak_cpu_threads = pool.peak_cpu(),
            "Execution finished"
        );

        Ok(ExecutionSummary {
            state,
            peak_cpu_threads: pool.peak_cpu(),
        })
    }

    /// Resolves cache hits and starts every step that fits, until nothing
    /// changes. Admission is head-of-line in declaration order.
    async fn admit(
        &self,
        graph: &Graph,
        fingerprints: &[Fingerprint],
        state: &mut RunState,
        pool: &mut ResourcePool,
        reservations: &mut HashMap<StepId, Reservation>,
        active: &mut FuturesUnordered<BoxFuture<'static, Completion>>,
    ) {
        loop {
            let ready = graph.topological_ready(&state.done_set(), &state.claimed_set());
            let mut progressed = false;

            for &id in &ready {
                state.mark_ready(id);
                if state.mark_cache_checked(id) {
                    continue;
                }
                if let Some(outputs) = self.resolve_cached(graph.step(id), &fingerprints[id]).await {
                    info!(step = %graph.step(id).name, fingerprint = %fingerprints[id].short(), "Resolved from cache");
                    state.mark_cached(id, outputs);
                    progressed = true;
                }
            }

            for id in ready {
                if state.status(id).is_terminal() {
                    continue;
                }
                let step = graph.step(id);
                let inputs = match resolve_inputs(graph, state, step) {
                    Ok(inputs) => inputs,
                    Err(error) => {
                        self.finish(graph, fingerprints, state, id, Err(error), Duration::ZERO)
                            .await;
                        progressed = true;
                        if state.is_stopped() {
                            return;
                        }
                        continue;
                    }
                };

                let Some(reservation) = pool.try_reserve(&step.resources, step.inline) else {
                    debug!(step = %step.name, cpu_in_use = pool.cpu_in_use(), "Waiting for resources");
                    break;
                };

                let fingerprint = &fingerprints[id];
                let output_dir = self.options.steps_dir.join(fingerprint.as_str());
                let ctx = ActionContext {
                    step: step.name.clone(),
                    inputs,
                    outputs: step.outputs.clone(),
                    output_dir: output_dir.clone(),
                    params: step.params.clone(),
                    threads: step.resources.cpu_threads,
                    license_file: self.options.license_file.clone(),
                };

                let span = info_span!("step", step = %step.name, fingerprint = %fingerprint.short());
                let handle = tokio::spawn(run_step(step.clone(), ctx).instrument(span));
                let name = step.name.clone();
                active.push(
                    async move {
                        match handle.await {
                            Ok((result, wall_time)) => (id, result, wall_time),
                            Err(e) => {
                                let err = StepActionError::new(name, format!("task join error: {e}"));
                                (id, Err(StepError::Action(err)), Duration::ZERO)
                            }
                        }
                    }
                    .boxed(),
                );

                reservations.insert(id, reservation);
                state.mark_running(id, output_dir);
                progressed = true;
            }

            if !progressed {
                return;
            }
        }
    }

    /// Returns cached outputs if the store holds a usable success entry.
    ///
    /// Failed entries and entries whose files have disappeared are
    /// invalidated so the new result can be committed.
    async fn resolve_cached(&self, step: &Step, fingerprint: &Fingerprint) -> Option<ArtifactMap> {
        let entry = match self.store.lookup(fingerprint).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(step = %step.name, error = %e, "Cache lookup failed; treating as a miss");
                return None;
            }
        };

        if entry.is_success() {
            let missing = entry
                .outputs
                .values()
                .find_map(ArtifactValue::first_missing_path)
                .map(Path::to_path_buf);
            match missing {
                None => return Some(entry.outputs),
                Some(path) => {
                    warn!(step = %step.name, path = %path.display(), "Cached output is gone; rerunning");
                }
            }
        } else {
            debug!(step = %step.name, "Previous attempt failed; rerunning");
        }

        if let Err(e) = self.store.invalidate(fingerprint).await {
            warn!(step = %step.name, error = %e, "Failed to invalidate cache entry");
        }
        None
    }

    /// Commits a completed step and updates the run state.
    async fn finish(
        &self,
        graph: &Graph,
        fingerprints: &[Fingerprint],
        state: &mut RunState,
        id: StepId,
        result: StepResult,
        wall_time: Duration,
    ) {
        let step = graph.step(id);
        let fingerprint = &fingerprints[id];
        let entry = match &result {
            Ok(outputs) => CacheEntry::success(fingerprint.clone(), &step.name, outputs.clone()),
            Err(error) => CacheEntry::failed(fingerprint.clone(), &step.name, error.clone()),
        };

        let result = match self.store.commit(entry).await {
            Ok(CommitOutcome::Committed) => result,
            Ok(CommitOutcome::AlreadyCommitted(existing)) => {
                debug!(step = %step.name, "Another writer committed first; using its entry");
                if existing.is_success() {
                    Ok(existing.outputs)
                } else {
                    Err(existing.error.unwrap_or_else(|| {
                        StepError::Action(StepActionError::new(&step.name, "failed in a concurrent run"))
                    }))
                }
            }
            Err(e) => {
                warn!(step = %step.name, error = %e, "Failed to commit cache entry");
                result
            }
        };

        match result {
            Ok(outputs) => {
                info!(
                    step = %step.name,
                    fingerprint = %fingerprint.short(),
                    wall_ms = wall_time.as_millis() as u64,
                    "Step completed"
                );
                state.mark_done(id, outputs, wall_time);
            }
            Err(error) => {
                error!(step = %step.name, fingerprint = %fingerprint.short(), error = %error, "Step failed");
                state.mark_failed(id, error, wall_time);

                for descendant in graph.descendants(id) {
                    if state.status(descendant).is_waiting() {
                        debug!(step = %graph.step(descendant).name, upstream = %step.name, "Skipping step after upstream failure");
                        state.mark_failed(
                            descendant,
                            StepError::Upstream {
                                upstream: step.name.clone(),
                            },
                            Duration::ZERO,
                        );
                    }
                }

                if state.crash_policy.stops_on_failure() && !state.is_stopped() {
                    warn!(step = %step.name, "Stopping on first crash; draining running steps");
                    state.stop();
                }
            }
        }
    }
}

/// Builds the input map of a step from its dependencies' outputs.
fn resolve_inputs(graph: &Graph, state: &RunState, step: &Step) -> StepResult {
    let mut inputs = ArtifactMap::new();
    for input in &step.inputs {
        let value = match &input.source {
            InputSource::Artifact { step: producer, output } => graph
                .id_of(producer)
                .and_then(|pid| state.record(pid).outputs.get(output))
                .cloned()
                .ok_or_else(|| {
                    StepError::MissingOutput(MissingOutputError {
                        step: producer.clone(),
                        artifact: output.clone(),
                        path: None,
                    })
                })?,
            InputSource::External(path) => ArtifactValue::File(path.clone()),
            InputSource::Value(value) => ArtifactValue::Value(value.clone()),
        };
        inputs.insert(input.name.clone(), value);
    }
    Ok(inputs)
}

/// Runs one step's action in a fresh output directory and checks its
/// declared outputs.
async fn run_step(step: Step, ctx: ActionContext) -> (StepResult, Duration) {
    let started = Instant::now();
    debug!(threads = ctx.threads, output_dir = %ctx.output_dir.display(), "Running step");

    if let Err(e) = reset_dir(&ctx.output_dir).await {
        let err = ctx.fail(format!("cannot prepare {}: {e}", ctx.output_dir.display()));
        return (Err(StepError::Action(err)), started.elapsed());
    }

    let result = match AssertUnwindSafe(step.action.execute(&ctx)).catch_unwind().await {
        Ok(Ok(outputs)) => verify_outputs(&step, outputs),
        Ok(Err(e)) => Err(StepError::Action(e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StepError::Action(ctx.fail(format!("action panicked: {message}"))))
        }
    };

    (result, started.elapsed())
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Checks that every declared output was returned and exists on disk.
fn verify_outputs(step: &Step, outputs: ArtifactMap) -> StepResult {
    for descriptor in &step.outputs {
        let Some(value) = outputs.get(&descriptor.name) else {
            return Err(StepError::MissingOutput(MissingOutputError {
                step: step.name.clone(),
                artifact: descriptor.name.clone(),
                path: None,
            }));
        };
        if let Some(path) = value.first_missing_path() {
            return Err(StepError::MissingOutput(MissingOutputError {
                step: step.name.clone(),
                artifact: descriptor.name.clone(),
                path: Some(path.to_path_buf()),
            }));
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactDescriptor, ResourceRequest, StepStatus};
    use crate::errors::StoreError;
    use crate::graph::GraphBuilder;
    use crate::steps::{fingerprint_graph, HashMethod, StepAction};
    use crate::store::{InMemoryArtifactStore, MockArtifactStore};
    use crate::testing::{
        ConcurrencyGauge, FailingAction, MissingOutputAction, PanickingAction, RecordingAction,
    };
    use pretty_assertions::assert_eq;

    fn step(name: &str, action: Arc<dyn StepAction>, threads: usize) -> Step {
        Step::new(name, action)
            .with_output(ArtifactDescriptor::file("out"))
            .with_resources(ResourceRequest::threads(threads))
    }

    fn options(dir: &Path, nprocs: usize, omp: usize) -> ExecutorOptions {
        ExecutorOptions::new(Budget::new(nprocs, omp), dir.join("steps"))
            .with_poll_sleep(Duration::from_millis(10))
    }

    async fn run(
        graph: &Graph,
        options: ExecutorOptions,
        store: Arc<dyn ArtifactStore>,
    ) -> ExecutionSummary {
        let fingerprints = fingerprint_graph(graph, HashMethod::Content).await.unwrap();
        Executor::new(options, store)
            .execute(graph, &fingerprints)
            .await
            .unwrap()
    }

    fn status_of(graph: &Graph, summary: &ExecutionSummary, name: &str) -> StepStatus {
        summary.state.status(graph.id_of(name).unwrap())
    }

    #[tokio::test]
    async fn test_runs_all_steps_and_passes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(RecordingAction::new("rec"));
        let graph = GraphBuilder::new()
            .step(step("anat", action.clone(), 1))
            .step(step("bold", action.clone(), 1).with_input_from("ref", "anat", "out"))
            .build()
            .unwrap();

        let summary = run(&graph, options(dir.path(), 2, 1), Arc::new(InMemoryArtifactStore::new())).await;

        assert_eq!(summary.state.done().len(), 2);
        assert_eq!(action.calls(), vec!["anat", "bold"]);
        let out = summary.state.record(0).outputs["out"].as_file().unwrap();
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_resource_invariant_holds() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = ConcurrencyGauge::new();
        let mut builder = GraphBuilder::new();
        for i in 0..8 {
            let action = Arc::new(
                RecordingAction::new("work")
                    .with_delay(Duration::from_millis(20))
                    .with_gauge(gauge.clone()),
            );
            builder.add_step(step(&format!("s{i}"), action, 1 + i % 3));
        }
        let graph = builder.build().unwrap();

        let summary = run(&graph, options(dir.path(), 4, 3), Arc::new(InMemoryArtifactStore::new())).await;

        assert_eq!(summary.state.done().len(), 8);
        assert!(gauge.peak() <= 4, "peak {} exceeds nprocs", gauge.peak());
        assert!(summary.peak_cpu_threads <= 4);
    }

    #[tokio::test]
    async fn test_crash_propagation_stop_on_first_crash() {
        let dir = tempfile::tempdir().unwrap();
        let c_action = Arc::new(RecordingAction::new("c"));
        let d_action = Arc::new(RecordingAction::new("d"));
        let graph = GraphBuilder::new()
            .step(step("a", Arc::new(RecordingAction::new("a")), 1))
            .step(step("b", Arc::new(FailingAction::new("b", "boom")), 1).with_input_from("x", "a", "out"))
            .step(step("c", c_action.clone(), 1).with_input_from("x", "b", "out"))
            .step(step("d", d_action.clone(), 1).with_input_from("x", "a", "out").with_input_from("y", "b", "out"))
            .step(step("e", Arc::new(RecordingAction::new("e")), 1))
            .build()
            .unwrap();

        let summary = run(&graph, options(dir.path(), 1, 1), Arc::new(InMemoryArtifactStore::new())).await;

        assert_eq!(status_of(&graph, &summary, "b"), StepStatus::Failed);
        assert_eq!(status_of(&graph, &summary, "c"), StepStatus::Failed);
        assert_eq!(
            summary.state.record(graph.id_of("c").unwrap()).error,
            Some(StepError::Upstream { upstream: "b".to_string() })
        );
        assert_eq!(c_action.call_count(), 0);
        assert_eq!(d_action.call_count(), 0);
        assert!(summary.state.is_stopped());
        // With one slot, `e` is declared after `b` and was never admitted.
        assert!(status_of(&graph, &summary, "e").is_waiting());
    }

    #[tokio::test]
    async fn test_independent_branches_continue() {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphBuilder::new()
            .step(step("a", Arc::new(FailingAction::new("a", "boom")), 1))
            .step(step("b", Arc::new(RecordingAction::new("b")), 1).with_input_from("x", "a", "out"))
            .step(step("d", Arc::new(RecordingAction::new("d")), 1))
            .build()
            .unwrap();
        let opts = options(dir.path(), 1, 1).with_crash_policy(CrashPolicy::ContinueIndependent);

        let summary = run(&graph, opts, Arc::new(InMemoryArtifactStore::new())).await;

        assert_eq!(status_of(&graph, &summary, "a"), StepStatus::Failed);
        assert_eq!(status_of(&graph, &summary, "b"), StepStatus::Failed);
        assert_eq!(status_of(&graph, &summary, "d"), StepStatus::Done);
        assert!(!summary.state.is_stopped());
    }

    #[tokio::test]
    async fn test_second_run_is_fully_cached() {
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(RecordingAction::new("rec"));
        let graph = GraphBuilder::new()
            .step(step("a", action.clone(), 1))
            .step(step("b", action.clone(), 1).with_input_from("x", "a", "out"))
            .build()
            .unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());

        run(&graph, options(dir.path(), 2, 1), store.clone()).await;
        let second = run(&graph, options(dir.path(), 2, 1), store).await;

        assert_eq!(action.call_count(), 2);
        assert!(second.state.records().iter().all(|r| r.cached));
    }

    #[tokio::test]
    async fn test_missing_output_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphBuilder::new()
            .step(step("seg", Arc::new(MissingOutputAction::new("seg")), 1))
            .build()
            .unwrap();
        let store = Arc::new(InMemoryArtifactStore::new());

        let summary = run(&graph, options(dir.path(), 1, 1), store.clone()).await;

        let record = summary.state.record(0);
        assert_eq!(record.status, StepStatus::Failed);
        assert!(matches!(record.error, Some(StepError::MissingOutput(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_action_is_a_step_failure() {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphBuilder::new()
            .step(step("boom", Arc::new(PanickingAction), 1))
            .build()
            .unwrap();

        let summary = run(&graph, options(dir.path(), 1, 1), Arc::new(InMemoryArtifactStore::new())).await;

        match &summary.state.record(0).error {
            Some(StepError::Action(e)) => assert!(e.message.contains("action panicked")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_entry_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryArtifactStore::new());
        let failing = GraphBuilder::new()
            .step(step("anat", Arc::new(FailingAction::new("anat", "boom")), 1))
            .build()
            .unwrap();
        let fingerprints = fingerprint_graph(&failing, HashMethod::Content).await.unwrap();
        Executor::new(options(dir.path(), 1, 1), store.clone())
            .execute(&failing, &fingerprints)
            .await
            .unwrap();
        assert!(!store.get(&fingerprints[0]).unwrap().is_success());

        // Same identity, now succeeding: the failed entry must not block it.
        let action = Arc::new(RecordingAction::new("anat").with_version("1"));
        let fixed = GraphBuilder::new().step(step("anat", action.clone(), 1)).build().unwrap();
        let fixed_fps = fingerprint_graph(&fixed, HashMethod::Content).await.unwrap();
        assert_eq!(fixed_fps, fingerprints);

        Executor::new(options(dir.path(), 1, 1), store.clone())
            .execute(&fixed, &fixed_fps)
            .await
            .unwrap();
        assert_eq!(action.call_count(), 1);
        assert!(store.get(&fingerprints[0]).unwrap().is_success());
    }

    #[tokio::test]
    async fn test_vanished_cached_output_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(RecordingAction::new("rec"));
        let graph = GraphBuilder::new().step(step("a", action.clone(), 1)).build().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());

        let first = run(&graph, options(dir.path(), 1, 1), store.clone()).await;
        let out = first.state.record(0).outputs["out"].as_file().unwrap().to_path_buf();
        std::fs::remove_file(&out).unwrap();

        let second = run(&graph, options(dir.path(), 1, 1), store).await;
        assert_eq!(action.call_count(), 2);
        assert!(!second.state.record(0).cached);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_store_lookup_error_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockArtifactStore::new();
        store
            .expect_lookup()
            .returning(|_| Err(StoreError::io("/cache", std::io::Error::other("unreadable"))));
        store
            .expect_commit()
            .times(1)
            .returning(|_| Ok(CommitOutcome::Committed));

        let action = Arc::new(RecordingAction::new("rec"));
        let graph = GraphBuilder::new().step(step("a", action.clone(), 1)).build().unwrap();

        let summary = run(&graph, options(dir.path(), 1, 1), Arc::new(store)).await;

        assert_eq!(action.call_count(), 1);
        assert_eq!(summary.state.status(0), StepStatus::Done);
    }

    #[tokio::test]
    async fn test_inline_steps_reserve_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphBuilder::new()
            .step(step("big", Arc::new(RecordingAction::new("big")), 2))
            .step(step("sink", Arc::new(RecordingAction::new("sink")), 4).inline())
            .build()
            .unwrap();

        let summary = run(&graph, options(dir.path(), 2, 2), Arc::new(InMemoryArtifactStore::new())).await;

        assert_eq!(summary.state.done().len(), 2);
        assert_eq!(summary.peak_cpu_threads, 2);
    }

    #[tokio::test]
    async fn test_over_budget_step_is_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let action = Arc::new(RecordingAction::new("rec"));
        let graph = GraphBuilder::new().step(step("anat", action.clone(), 8)).build().unwrap();
        let fingerprints = fingerprint_graph(&graph, HashMethod::Content).await.unwrap();

        let err = Executor::new(options(dir.path(), 4, 4), Arc::new(InMemoryArtifactStore::new()))
            .execute(&graph, &fingerprints)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ResourceBudget(ref e) if e.step == "anat"));
        assert_eq!(action.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_drains_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = Arc::new(CancellationToken::new());
        let slow = Arc::new(RecordingAction::new("slow").with_delay(Duration::from_millis(100)));
        let after = Arc::new(RecordingAction::new("after"));
        let graph = GraphBuilder::new()
            .step(step("slow", slow.clone(), 1))
            .step(step("after", after.clone(), 1).with_input_from("x", "slow", "out"))
            .build()
            .unwrap();
        let fingerprints = fingerprint_graph(&graph, HashMethod::Content).await.unwrap();

        let executor = Executor::new(options(dir.path(), 1, 1), Arc::new(InMemoryArtifactStore::new()))
            .with_cancellation(cancel.clone());
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel("interrupted");
            })
        };
        let summary = executor.execute(&graph, &fingerprints).await.unwrap();
        trigger.await.unwrap();

        assert!(summary.state.is_cancelled());
        assert_eq!(summary.state.status(0), StepStatus::Done);
        assert!(summary.state.status(1).is_waiting());
        assert_eq!(after.call_count(), 0);
    }
}
