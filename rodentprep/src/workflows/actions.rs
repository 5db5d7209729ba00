//! Step actions used by the preprocessing workflow.

use crate::config::ToolConfig;
use crate::core::{ArtifactKind, ArtifactMap, ArtifactValue};
use crate::errors::StepActionError;
use crate::steps::{ActionContext, StepAction};
use async_trait::async_trait;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(?:(in|out|param):([A-Za-z0-9_]+)|(outdir|omp_nthreads|license))\}")
        .expect("placeholder pattern is valid")
});

/// Runs a configured external program.
///
/// The action version is a digest of the tool configuration, so editing a
/// tool's command line invalidates its cached results.
#[derive(Debug, Clone)]
pub struct CommandAction {
    id: String,
    version: String,
    tool: ToolConfig,
}

impl CommandAction {
    /// Creates an action running `tool` for steps of kind `kind`.
    #[must_use]
    pub fn new(kind: &str, tool: ToolConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(&tool).unwrap_or_default().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self {
            id: format!("command:{kind}"),
            version: digest[..16].to_string(),
            tool,
        }
    }

    /// Files the tool writes for a declared output.
    fn output_files(&self, ctx: &ActionContext, name: &str) -> Vec<PathBuf> {
        match self.tool.outputs.get(name) {
            Some(output) => output.files().into_iter().map(|f| ctx.output_path(f)).collect(),
            None => vec![ctx.output_path(format!("{name}.nii.gz"))],
        }
    }

    /// Expands the placeholders of one argument.
    fn render(&self, ctx: &ActionContext, template: &str) -> Result<String, StepActionError> {
        let mut error = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
            let value = match (caps.get(1).map(|m| m.as_str()), caps.get(2), caps.get(3)) {
                (Some("in"), Some(name), _) => ctx.input(name.as_str()).and_then(|v| match v {
                    ArtifactValue::Value(json) => Ok(json_to_arg(json)),
                    other => Ok(join_paths(&other.paths())),
                }),
                (Some("out"), Some(name), _) => Ok(join_paths(
                    &self
                        .output_files(ctx, name.as_str())
                        .iter()
                        .map(PathBuf::as_path)
                        .collect::<Vec<_>>(),
                )),
                (Some("param"), Some(name), _) => ctx
                    .params
                    .get(name.as_str())
                    .map(json_to_arg)
                    .ok_or_else(|| ctx.fail(format!("parameter '{}' is not set", name.as_str()))),
                (_, _, Some(kw)) => match kw.as_str() {
                    "outdir" => Ok(ctx.output_dir.display().to_string()),
                    "omp_nthreads" => Ok(ctx.threads.to_string()),
                    _ => ctx
                        .license_file
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .ok_or_else(|| ctx.fail("tool needs a license file but none was given")),
                },
                _ => Ok(caps[0].to_string()),
            };
            value.unwrap_or_else(|e| {
                error.get_or_insert(e);
                String::new()
            })
        });
        match error {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }
}

fn join_paths(paths: &[&Path]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn json_to_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl StepAction for CommandAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        let args = self
            .tool
            .args
            .iter()
            .map(|a| self.render(ctx, a))
            .collect::<Result<Vec<_>, _>>()?;

        info!(step = %ctx.step, program = %self.tool.program, "Running tool");
        let mut command = tokio::process::Command::new(&self.tool.program);
        command
            .args(&args)
            .current_dir(&ctx.output_dir)
            .env("OMP_NUM_THREADS", ctx.threads.to_string())
            .env("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS", ctx.threads.to_string())
            .envs(&self.tool.env)
            .kill_on_drop(true);
        if let Some(license) = &ctx.license_file {
            command.env("FS_LICENSE", license);
        }

        let output = command
            .output()
            .await
            .map_err(|e| ctx.fail(format!("cannot start '{}': {e}", self.tool.program)))?;

        let mut log = format!("$ {} {}\n", self.tool.program, args.join(" ")).into_bytes();
        log.extend_from_slice(&output.stdout);
        log.extend_from_slice(&output.stderr);
        tokio::fs::write(ctx.output_path("command.log"), log)
            .await
            .map_err(|e| ctx.fail(format!("cannot write command log: {e}")))?;

        if !output.status.success() {
            return Err(ctx.fail(format!("'{}' exited with {}", self.tool.program, output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut outputs = ArtifactMap::new();
        for descriptor in &ctx.outputs {
            let files = self.output_files(ctx, &descriptor.name);
            let value = match descriptor.kind {
                ArtifactKind::File => ArtifactValue::File(files.into_iter().next().unwrap_or_default()),
                ArtifactKind::FileSet => ArtifactValue::FileSet(files),
                ArtifactKind::Value => ArtifactValue::Value(
                    serde_json::from_str(stdout.trim())
                        .unwrap_or_else(|_| serde_json::Value::String(stdout.trim().to_string())),
                ),
            };
            outputs.insert(descriptor.name.clone(), value);
        }
        Ok(outputs)
    }
}

/// Placeholder for a step with no configured tool: every file output is a
/// copy of the step's primary input, and every file-set output holds a copy
/// of each file input.
#[derive(Debug, Clone)]
pub struct CopyAction {
    id: String,
}

impl CopyAction {
    /// Creates a placeholder for steps of kind `kind`.
    #[must_use]
    pub fn new(kind: &str) -> Self {
        Self {
            id: format!("copy:{kind}"),
        }
    }
}

#[async_trait]
impl StepAction for CopyAction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        let source = ctx
            .inputs
            .values()
            .find_map(ArtifactValue::primary_path)
            .ok_or_else(|| ctx.fail("no file input to copy"))?;

        let mut outputs = ArtifactMap::new();
        for descriptor in &ctx.outputs {
            let value = match descriptor.kind {
                ArtifactKind::File => {
                    let target = ctx.output_path(format!("{}{}", descriptor.name, image_suffix(source)));
                    copy_file(ctx, source, &target).await?;
                    ArtifactValue::File(target)
                }
                ArtifactKind::FileSet => {
                    let sources = ctx.inputs.values().flat_map(ArtifactValue::paths);
                    let mut targets = Vec::new();
                    for (i, source) in sources.enumerate() {
                        let target =
                            ctx.output_path(format!("{}_{i:02}{}", descriptor.name, image_suffix(source)));
                        copy_file(ctx, source, &target).await?;
                        targets.push(target);
                    }
                    ArtifactValue::FileSet(targets)
                }
                ArtifactKind::Value => ArtifactValue::Value(serde_json::json!({
                    "step": ctx.step,
                    "source": source.display().to_string(),
                })),
            };
            outputs.insert(descriptor.name.clone(), value);
        }
        debug!(step = %ctx.step, outputs = outputs.len(), "Materialised placeholder outputs");
        Ok(outputs)
    }
}

async fn copy_file(ctx: &ActionContext, source: &Path, target: &Path) -> Result<(), StepActionError> {
    tokio::fs::copy(source, target)
        .await
        .map(|_| ())
        .map_err(|e| ctx.fail(format!("cannot copy {}: {e}", source.display())))
}

/// Returns `.nii.gz`, `.nii` or the file's extension (with the dot).
fn image_suffix(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    if name.ends_with(".nii.gz") {
        ".nii.gz".to_string()
    } else {
        path.extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// Checks the dataset description (input `description`) and reports what
/// was found.
#[derive(Debug, Clone, Default)]
pub struct BidsValidateAction;

#[async_trait]
impl StepAction for BidsValidateAction {
    fn id(&self) -> &str {
        "bids_validate"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        let description = ctx.input_path("description")?;
        let bytes = tokio::fs::read(description)
            .await
            .map_err(|e| ctx.fail(format!("cannot read {}: {e}", description.display())))?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| ctx.fail(format!("invalid dataset_description.json: {e}")))?;
        let name = json
            .get("Name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ctx.fail("dataset_description.json has no Name"))?;

        let mut outputs = ArtifactMap::new();
        outputs.insert(
            "summary".to_string(),
            ArtifactValue::Value(serde_json::json!({
                "name": name,
                "bids_version": json.get("BIDSVersion").cloned().unwrap_or(serde_json::Value::Null),
            })),
        );
        Ok(outputs)
    }
}

/// Copies final artifacts into the derivatives tree:
/// `<output_dir>/sub-<label>/<datatype>/sub-<label>_<input>.<ext>`.
#[derive(Debug, Clone)]
pub struct DerivativesAction {
    output_dir: PathBuf,
    subject: String,
    datatype: &'static str,
}

impl DerivativesAction {
    /// Creates a sink for one subject and datatype (`anat` or `func`).
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, subject: impl Into<String>, datatype: &'static str) -> Self {
        Self {
            output_dir: output_dir.into(),
            subject: subject.into(),
            datatype,
        }
    }
}

#[async_trait]
impl StepAction for DerivativesAction {
    fn id(&self) -> &str {
        "derivatives"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ArtifactMap, StepActionError> {
        let target_dir = self
            .output_dir
            .join(format!("sub-{}", self.subject))
            .join(self.datatype);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| ctx.fail(format!("cannot create {}: {e}", target_dir.display())))?;

        let description = self.output_dir.join("dataset_description.json");
        if !description.exists() {
            let body = serde_json::json!({
                "Name": "rodentprep derivatives",
                "BIDSVersion": "1.8.0",
                "DatasetType": "derivative",
                "GeneratedBy": [{"Name": "rodentprep", "Version": env!("CARGO_PKG_VERSION")}],
            });
            tokio::fs::write(&description, body.to_string())
                .await
                .map_err(|e| ctx.fail(format!("cannot write {}: {e}", description.display())))?;
        }

        let mut written = Vec::new();
        for (name, value) in &ctx.inputs {
            for (i, source) in value.paths().into_iter().enumerate() {
                let index = if i == 0 { String::new() } else { format!("-{i}") };
                let file = format!("sub-{}_{name}{index}{}", self.subject, image_suffix(source));
                let target = target_dir.join(file);
                tokio::fs::copy(source, &target)
                    .await
                    .map_err(|e| ctx.fail(format!("cannot copy {}: {e}", source.display())))?;
                written.push(target);
            }
        }

        info!(subject = %self.subject, datatype = self.datatype, files = written.len(), "Wrote derivatives");
        let mut outputs = ArtifactMap::new();
        outputs.insert("files".to_string(), ArtifactValue::FileSet(written));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolOutput;
    use crate::core::ArtifactDescriptor;
    use std::collections::BTreeMap;

    fn context(dir: &Path, outputs: Vec<ArtifactDescriptor>) -> ActionContext {
        let input = dir.join("t2w.nii.gz");
        std::fs::write(&input, b"voxels").unwrap();
        let out = dir.join("out");
        std::fs::create_dir_all(&out).unwrap();

        let mut inputs = ArtifactMap::new();
        inputs.insert("anat".to_string(), ArtifactValue::File(input));
        let mut params = BTreeMap::new();
        params.insert("sloppy".to_string(), serde_json::json!(true));

        ActionContext {
            step: "brain_extraction".to_string(),
            inputs,
            outputs,
            output_dir: out,
            params,
            threads: 3,
            license_file: None,
        }
    }

    fn tool(program: &str, args: &[&str]) -> ToolConfig {
        ToolConfig {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            outputs: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_render_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![ArtifactDescriptor::file("brain")]);
        let mut config = tool("bet", &[]);
        config
            .outputs
            .insert("brain".to_string(), ToolOutput::One("brain_out.nii.gz".to_string()));
        let action = CommandAction::new("brain_extraction", config);

        let rendered = action
            .render(&ctx, "{in:anat} -o {out:brain} -t {omp_nthreads} -s {param:sloppy} {outdir}")
            .unwrap();

        assert_eq!(
            rendered,
            format!(
                "{} -o {} -t 3 -s true {}",
                dir.path().join("t2w.nii.gz").display(),
                dir.path().join("out/brain_out.nii.gz").display(),
                dir.path().join("out").display()
            )
        );
    }

    #[test]
    fn test_render_reports_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![]);
        let action = CommandAction::new("x", tool("x", &[]));

        assert!(action.render(&ctx, "{license}").is_err());
        assert!(action.render(&ctx, "{in:nope}").is_err());
        assert!(action.render(&ctx, "{param:nope}").is_err());
        assert_eq!(action.render(&ctx, "{unknown}").unwrap(), "{unknown}");
    }

    #[test]
    fn test_version_tracks_tool_config() {
        let a = CommandAction::new("seg", tool("fast", &["-n", "3"]));
        let b = CommandAction::new("seg", tool("fast", &["-n", "4"]));
        assert_eq!(a.id(), "command:seg");
        assert_ne!(a.version(), b.version());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_action_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![ArtifactDescriptor::file("brain")]);
        let action = CommandAction::new("brain_extraction", tool("cp", &["{in:anat}", "{out:brain}"]));

        let outputs = action.execute(&ctx).await.unwrap();

        let brain = outputs["brain"].as_file().unwrap();
        assert_eq!(std::fs::read(brain).unwrap(), b"voxels");
        assert!(ctx.output_path("command.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_action_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![]);
        let action = CommandAction::new("x", tool("false", &[]));

        let err = action.execute(&ctx).await.unwrap_err();
        assert!(err.message.contains("exited with"));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![]);
        let action = CommandAction::new("x", tool("/nonexistent/rodentprep-tool", &[]));

        let err = action.execute(&ctx).await.unwrap_err();
        assert!(err.message.contains("cannot start"));
    }

    #[tokio::test]
    async fn test_copy_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            vec![
                ArtifactDescriptor::file("brain"),
                ArtifactDescriptor::file_set("tpms"),
                ArtifactDescriptor::value("qc"),
            ],
        );

        let outputs = CopyAction::new("brain_extraction").execute(&ctx).await.unwrap();

        let brain = outputs["brain"].as_file().unwrap();
        assert!(brain.ends_with("brain.nii.gz"));
        assert_eq!(std::fs::read(brain).unwrap(), b"voxels");
        assert_eq!(outputs["tpms"].paths().len(), 1);
        assert_eq!(outputs["qc"].kind(), ArtifactKind::Value);
    }

    #[tokio::test]
    async fn test_copy_action_file_set_holds_every_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), vec![ArtifactDescriptor::file_set("images")]);
        let second = dir.path().join("run-02_T2w.nii");
        std::fs::write(&second, b"more voxels").unwrap();
        ctx.inputs.insert("image_01".to_string(), ArtifactValue::File(second));
        ctx.inputs
            .insert("dataset".to_string(), ArtifactValue::Value(serde_json::json!({"name": "mice"})));

        let outputs = CopyAction::new("anat_validate").execute(&ctx).await.unwrap();

        let images = outputs["images"].paths();
        assert_eq!(images.len(), 2);
        assert!(images[0].ends_with("images_00.nii.gz"));
        assert!(images[1].ends_with("images_01.nii"));
        assert_eq!(std::fs::read(images[1]).unwrap(), b"more voxels");
    }

    #[tokio::test]
    async fn test_bids_validate() {
        let dir = tempfile::tempdir().unwrap();
        let description = dir.path().join("dataset_description.json");
        let mut ctx = context(dir.path(), vec![ArtifactDescriptor::value("summary")]);
        ctx.inputs
            .insert("description".to_string(), ArtifactValue::File(description.clone()));

        assert!(BidsValidateAction.execute(&ctx).await.is_err());

        std::fs::write(&description, r#"{"BIDSVersion": "1.8.0"}"#).unwrap();
        let err = BidsValidateAction.execute(&ctx).await.unwrap_err();
        assert!(err.message.contains("no Name"));

        std::fs::write(&description, r#"{"Name": "mice"}"#).unwrap();
        let outputs = BidsValidateAction.execute(&ctx).await.unwrap();
        match &outputs["summary"] {
            ArtifactValue::Value(v) => assert_eq!(v["name"], "mice"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_derivatives_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![ArtifactDescriptor::file_set("files")]);
        let derivatives = dir.path().join("derivatives");

        let outputs = DerivativesAction::new(&derivatives, "01", "anat")
            .execute(&ctx)
            .await
            .unwrap();

        let copied = derivatives.join("sub-01/anat/sub-01_anat.nii.gz");
        assert!(copied.exists());
        assert_eq!(outputs["files"].paths(), vec![copied.as_path()]);
        assert!(derivatives.join("dataset_description.json").exists());
    }
}
