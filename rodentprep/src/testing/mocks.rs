//! Mock actions for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{ArtifactKind, ArtifactMap, ArtifactValue};
use crate::errors::StepActionError;
use crate::steps::{ActionContext, StepAction};

/// Writes a small placeholder file for every declared output and returns
/// the matching artifact map.
///
/// # Errors
///
/// Fails if a file cannot be written.
pub fn materialize_outputs(ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
    std::fs::create_dir_all(&ctx.output_dir).map_err(|e| ctx.fail(e.to_string()))?;
    let mut outputs = ArtifactMap::new();

    for descriptor in &ctx.outputs {
        let value = match descriptor.kind {
            ArtifactKind::File => {
                let path = ctx.output_path(format!("{}.nii.gz", descriptor.name));
                std::fs::write(&path, ctx.step.as_bytes()).map_err(|e| ctx.fail(e.to_string()))?;
                ArtifactValue::File(path)
            }
            ArtifactKind::FileSet => {
                let paths = (0..2)
                    .map(|i| {
                        let path = ctx.output_path(format!("{}_{i}.nii.gz", descriptor.name));
                        std::fs::write(&path, ctx.step.as_bytes())
                            .map(|()| path)
                            .map_err(|e| ctx.fail(e.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                ArtifactValue::FileSet(paths)
            }
            ArtifactKind::Value => ArtifactValue::Value(serde_json::json!({ "step": ctx.step })),
        };
        outputs.insert(descriptor.name.clone(), value);
    }

    Ok(outputs)
}

/// Tracks how many threads concurrently running actions hold.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    /// Creates a new gauge.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, threads: usize) {
        let now = self.current.fetch_add(threads, Ordering::SeqCst) + threads;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self, threads: usize) {
        self.current.fetch_sub(threads, Ordering::SeqCst);
    }

    /// Returns the highest thread count observed at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// An action that records calls and materialises its declared outputs.
#[derive(Debug)]
pub struct RecordingAction {
    id: String,
    version: String,
    delay: Option<Duration>,
    gauge: Option<Arc<ConcurrencyGauge>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingAction {
    /// Creates a new recording action.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: "1".to_string(),
            delay: None,
            gauge: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets the action version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sleeps for `delay` while executing.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reports held threads to `gauge` while executing.
    #[must_use]
    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Returns the number of times the action ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the step names the action ran for, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StepAction for RecordingAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        self.calls.lock().push(ctx.step.clone());
        if let Some(gauge) = &self.gauge {
            gauge.enter(ctx.threads);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = materialize_outputs(ctx);
        if let Some(gauge) = &self.gauge {
            gauge.exit(ctx.threads);
        }
        result
    }
}

/// An action that always fails.
#[derive(Debug)]
pub struct FailingAction {
    id: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingAction {
    /// Creates a failing action.
    #[must_use]
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the action ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAction for FailingAction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ctx.fail(self.message.clone()))
    }
}

/// An action that reports success without writing its declared files.
#[derive(Debug)]
pub struct MissingOutputAction {
    id: String,
}

impl MissingOutputAction {
    /// Creates the action.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl StepAction for MissingOutputAction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        let mut outputs = ArtifactMap::new();
        for descriptor in &ctx.outputs {
            if descriptor.kind == ArtifactKind::File {
                outputs.insert(
                    descriptor.name.clone(),
                    ArtifactValue::File(ctx.output_path(format!("{}.nii.gz", descriptor.name))),
                );
            }
        }
        Ok(outputs)
    }
}

/// An action that panics.
#[derive(Debug)]
pub struct PanickingAction;

#[async_trait]
impl StepAction for PanickingAction {
    fn id(&self) -> &str {
        "panic"
    }

    async fn execute(&self, _ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        panic!("action panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactDescriptor;
    use std::collections::BTreeMap;

    fn context(dir: &std::path::Path) -> ActionContext {
        ActionContext {
            step: "anat".to_string(),
            inputs: ArtifactMap::new(),
            outputs: vec![
                ArtifactDescriptor::file("brain"),
                ArtifactDescriptor::file_set("tpms"),
                ArtifactDescriptor::value("qc"),
            ],
            output_dir: dir.join("out"),
            params: BTreeMap::new(),
            threads: 2,
            license_file: None,
        }
    }

    #[tokio::test]
    async fn test_recording_action_materializes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = ConcurrencyGauge::new();
        let action = RecordingAction::new("rec").with_gauge(gauge.clone());

        let outputs = action.execute(&context(dir.path())).await.unwrap();

        assert_eq!(action.call_count(), 1);
        assert_eq!(action.calls(), vec!["anat"]);
        assert!(outputs["brain"].first_missing_path().is_none());
        assert_eq!(outputs["tpms"].paths().len(), 2);
        assert_eq!(outputs["qc"].kind(), ArtifactKind::Value);
        assert_eq!(gauge.peak(), 2);
    }

    #[tokio::test]
    async fn test_failing_action() {
        let dir = tempfile::tempdir().unwrap();
        let action = FailingAction::new("fail", "boom");
        let err = action.execute(&context(dir.path())).await.unwrap_err();
        assert_eq!(err.step, "anat");
        assert_eq!(action.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_output_action_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = MissingOutputAction::new("missing")
            .execute(&context(dir.path()))
            .await
            .unwrap();
        assert!(outputs["brain"].first_missing_path().is_some());
    }
}
