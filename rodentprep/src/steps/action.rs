//! The opaque action interface executed by each step.

use crate::core::{ArtifactDescriptor, ArtifactMap, ArtifactValue};
use crate::errors::StepActionError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Trait for step actions.
///
/// An action is the algorithm a step runs. The engine knows nothing about
/// its internals: it resolves the declared inputs, hands the action an output
/// directory, and checks that the declared outputs exist afterwards.
#[async_trait]
pub trait StepAction: Send + Sync + Debug {
    /// Stable identifier of the algorithm, part of every fingerprint.
    fn id(&self) -> &str;

    /// Version of the algorithm. Bumping it invalidates cached results.
    fn version(&self) -> &str {
        "1"
    }

    /// Executes the action.
    ///
    /// # Errors
    ///
    /// Returns a [`StepActionError`] if the algorithm failed.
    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError>;
}

/// Everything an action sees while it executes.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The step name.
    pub step: String,
    /// Resolved inputs keyed by input name.
    pub inputs: ArtifactMap,
    /// Outputs the step declares, in order.
    pub outputs: Vec<ArtifactDescriptor>,
    /// Directory the action must write its files into.
    pub output_dir: PathBuf,
    /// Configuration parameters that are part of the step's fingerprint.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Threads the action may use internally.
    pub threads: usize,
    /// License file for licensed external tools, passed through opaquely.
    pub license_file: Option<PathBuf>,
}

impl ActionContext {
    /// Builds an error attributed to this step.
    #[must_use]
    pub fn fail(&self, message: impl Into<String>) -> StepActionError {
        StepActionError::new(&self.step, message)
    }

    /// Returns a resolved input.
    ///
    /// # Errors
    ///
    /// Fails if the input was not declared.
    pub fn input(&self, name: &str) -> Result<&ArtifactValue, StepActionError> {
        self.inputs
            .get(name)
            .ok_or_else(|| self.fail(format!("input '{name}' is not declared")))
    }

    /// Returns the primary file path of a resolved input.
    ///
    /// # Errors
    ///
    /// Fails if the input is missing or does not reference a file.
    pub fn input_path(&self, name: &str) -> Result<&Path, StepActionError> {
        self.input(name)?
            .primary_path()
            .ok_or_else(|| self.fail(format!("input '{name}' is not a file")))
    }

    /// Returns a path inside the step's output directory.
    #[must_use]
    pub fn output_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.output_dir.join(file_name)
    }
}

/// A simple function-based action.
pub struct FnAction<F>
where
    F: Fn(&ActionContext) -> Result<ArtifactMap, StepActionError> + Send + Sync,
{
    id: String,
    version: String,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&ActionContext) -> Result<ArtifactMap, StepActionError> + Send + Sync,
{
    /// Creates a new function-based action.
    pub fn new(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            version: "1".to_string(),
            func,
        }
    }

    /// Sets the action version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl<F> Debug for FnAction<F>
where
    F: Fn(&ActionContext) -> Result<ArtifactMap, StepActionError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAction")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

#[async_trait]
impl<F> StepAction for FnAction<F>
where
    F: Fn(&ActionContext) -> Result<ArtifactMap, StepActionError> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        (self.func)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ActionContext {
        let mut inputs = ArtifactMap::new();
        inputs.insert("anat".to_string(), ArtifactValue::File(PathBuf::from("/data/t2w.nii.gz")));
        inputs.insert("n".to_string(), ArtifactValue::Value(serde_json::json!(3)));
        let mut params = BTreeMap::new();
        params.insert("sloppy".to_string(), serde_json::json!(true));

        ActionContext {
            step: "brain_extraction".to_string(),
            inputs,
            outputs: vec![ArtifactDescriptor::file("brain")],
            output_dir: PathBuf::from("/work/steps/abc"),
            params,
            threads: 4,
            license_file: None,
        }
    }

    #[tokio::test]
    async fn test_fn_action() {
        let action = FnAction::new("identity", |ctx| {
            let mut out = ArtifactMap::new();
            out.insert("brain".to_string(), ctx.input("anat")?.clone());
            Ok(out)
        })
        .with_version("2");

        assert_eq!(action.id(), "identity");
        assert_eq!(action.version(), "2");

        let out = action.execute(&test_context()).await.unwrap();
        assert!(out.contains_key("brain"));
    }

    #[test]
    fn test_context_helpers() {
        let ctx = test_context();
        assert_eq!(ctx.input_path("anat").unwrap(), Path::new("/data/t2w.nii.gz"));
        assert!(ctx.input_path("n").is_err());
        assert!(ctx.input("missing").is_err());
        assert_eq!(ctx.output_path("brain.nii.gz"), PathBuf::from("/work/steps/abc/brain.nii.gz"));
    }

    #[test]
    fn test_fail_attributes_step() {
        let err = test_context().fail("boom");
        assert_eq!(err.step, "brain_extraction");
        assert_eq!(err.message, "boom");
    }
}
