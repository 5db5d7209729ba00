//! The participant-level preprocessing workflow.

use super::actions::{BidsValidateAction, CommandAction, CopyAction, DerivativesAction};
use super::bids::{BidsDataset, BoldRun, Subject};
use crate::config::EngineConfig;
use crate::core::{ArtifactDescriptor, ResourceRequest};
use crate::errors::EngineError;
use crate::graph::{Graph, GraphBuilder};
use crate::steps::{Step, StepAction};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Tag carried by every step of the anatomical branch.
pub const ANAT_TAG: &str = "anat";

/// Template used for spatial normalisation unless overridden.
pub const DEFAULT_TEMPLATE: &str = "Fischer344";

const VALIDATE_STEP: &str = "bids_validate";

/// Options that shape the workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOptions {
    /// Faster, less accurate registration and normalisation.
    pub sloppy: bool,
    /// Build the anatomical branch only.
    pub anat_only: bool,
    /// Omit the dataset validation step.
    pub skip_bids_validation: bool,
    /// Threads each non-inline step requests.
    pub omp_nthreads: usize,
    /// Root of the derivatives tree.
    pub output_dir: PathBuf,
    /// Output spaces, one normalisation each. Never empty.
    pub templates: Vec<String>,
}

impl WorkflowOptions {
    /// Creates options with every flag off and the default template.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            sloppy: false,
            anat_only: false,
            skip_bids_validation: false,
            omp_nthreads: 1,
            output_dir: output_dir.into(),
            templates: vec![DEFAULT_TEMPLATE.to_string()],
        }
    }

    /// Sets the sloppy flag.
    #[must_use]
    pub fn with_sloppy(mut self, sloppy: bool) -> Self {
        self.sloppy = sloppy;
        self
    }

    /// Restricts the workflow to anatomical steps.
    #[must_use]
    pub fn with_anat_only(mut self, anat_only: bool) -> Self {
        self.anat_only = anat_only;
        self
    }

    /// Omits dataset validation.
    #[must_use]
    pub fn with_skip_bids_validation(mut self, skip: bool) -> Self {
        self.skip_bids_validation = skip;
        self
    }

    /// Sets the per-step thread count.
    #[must_use]
    pub fn with_omp_nthreads(mut self, omp_nthreads: usize) -> Self {
        self.omp_nthreads = omp_nthreads.max(1);
        self
    }

    /// Sets the output spaces. Repeats are dropped; an empty list keeps the
    /// default template.
    #[must_use]
    pub fn with_templates<I, S>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for template in templates {
            let template = template.into();
            if !unique.contains(&template) {
                unique.push(template);
            }
        }
        if !unique.is_empty() {
            self.templates = unique;
        }
        self
    }
}

/// Builds the workflow graph for every subject of `dataset`.
///
/// Subjects without an anatomical image are skipped with a warning. Unless
/// validation is skipped, every subject's entry steps consume the
/// validation summary, so nothing is processed when validation fails.
///
/// # Errors
///
/// Fails if the dataset description is missing (and validation is not
/// skipped), no subject can be processed, or the assembled graph is invalid.
pub fn build_workflow(
    dataset: &BidsDataset,
    options: &WorkflowOptions,
    config: &EngineConfig,
) -> Result<Graph, EngineError> {
    let factory = WorkflowFactory { options, config };
    let mut builder = GraphBuilder::new();

    if !options.skip_bids_validation {
        let description = dataset.root.join("dataset_description.json");
        if !description.is_file() {
            return Err(EngineError::Dataset(format!(
                "{} is missing; pass --skip-bids-validation to process the dataset anyway",
                description.display()
            )));
        }
        builder.add_step(
            Step::new(VALIDATE_STEP, Arc::new(BidsValidateAction))
                .with_external_input("description", description)
                .with_output(ArtifactDescriptor::value("summary"))
                .with_tag(ANAT_TAG)
                .inline(),
        );
    }

    let mut subjects = 0;
    for subject in &dataset.subjects {
        if subject.reference_images().is_none() {
            warn!(subject = %subject.label, "No anatomical image; skipping subject");
            continue;
        }
        builder.extend(factory.anat_steps(subject));
        if !subject.bold.is_empty() {
            for run in &subject.bold {
                builder.extend(factory.bold_steps(subject, run));
            }
            builder.add_step(factory.func_derivatives(subject));
        }
        subjects += 1;
    }

    if subjects == 0 {
        return Err(EngineError::Dataset(
            "no subject has an anatomical image".to_string(),
        ));
    }

    let graph = builder.build()?;
    let graph = if options.anat_only {
        graph.restrict(|s| s.has_tag(ANAT_TAG))?
    } else {
        graph
    };
    info!(
        subjects,
        steps = graph.len(),
        spaces = options.templates.len(),
        anat_only = options.anat_only,
        sloppy = options.sloppy,
        "Built workflow"
    );
    Ok(graph)
}

struct WorkflowFactory<'a> {
    options: &'a WorkflowOptions,
    config: &'a EngineConfig,
}

impl WorkflowFactory<'_> {
    /// The configured tool for `kind`, or a copy placeholder.
    fn action(&self, kind: &str) -> Arc<dyn StepAction> {
        match self.config.tool(kind) {
            Some(tool) => Arc::new(CommandAction::new(kind, tool.clone())),
            None => Arc::new(CopyAction::new(kind)),
        }
    }

    fn resources(&self, mem_gb: f64) -> ResourceRequest {
        ResourceRequest::threads(self.options.omp_nthreads).with_mem_gb(mem_gb)
    }

    /// Makes `step` a descendant of dataset validation.
    fn validated(&self, step: Step) -> Step {
        if self.options.skip_bids_validation {
            step
        } else {
            step.with_input_from("dataset", VALIDATE_STEP, "summary")
        }
    }

    /// The space used by steps that need a single normalisation.
    fn primary_space(&self) -> &str {
        self.options
            .templates
            .first()
            .map_or(DEFAULT_TEMPLATE, String::as_str)
    }

    fn anat_steps(&self, subject: &Subject) -> Vec<Step> {
        let sub = format!("sub-{}", subject.label);
        let name = |kind: &str| format!("{sub}/{kind}");
        let sloppy = json!(self.options.sloppy);
        let Some((contrast, images)) = subject.reference_images() else {
            return Vec::new();
        };

        let mut validate = Step::new(name("anat_validate"), self.action("anat_validate"));
        for (i, image) in images.iter().enumerate() {
            validate = validate.with_external_input(format!("image_{i:02}"), image);
        }
        let validate = self
            .validated(validate)
            .with_output(ArtifactDescriptor::file_set("images"))
            .with_tag(ANAT_TAG)
            .inline();

        // A single image is its own reference.
        let template = Step::new(name("anat_template"), self.action("anat_template"))
            .with_input_from("images", name("anat_validate"), "images")
            .with_output(ArtifactDescriptor::file("reference"))
            .with_param("contrast", json!(contrast))
            .with_tag(ANAT_TAG);
        let template = if images.len() == 1 {
            template.inline()
        } else {
            template.with_resources(self.resources(2.0))
        };

        let mut steps = vec![
            validate,
            template,
            Step::new(name("brain_extraction"), self.action("brain_extraction"))
                .with_input_from("anat", name("anat_template"), "reference")
                .with_output(ArtifactDescriptor::file("brain"))
                .with_output(ArtifactDescriptor::file("mask"))
                .with_param("sloppy", sloppy.clone())
                .with_resources(self.resources(2.0))
                .with_tag(ANAT_TAG),
        ];
        for space in &self.options.templates {
            steps.push(
                Step::new(name(&format!("anat_norm_{space}")), self.action("anat_norm"))
                    .with_input_from("brain", name("brain_extraction"), "brain")
                    .with_input_from("mask", name("brain_extraction"), "mask")
                    .with_output(ArtifactDescriptor::file("standardized"))
                    .with_output(ArtifactDescriptor::file("xfm"))
                    .with_param("sloppy", sloppy.clone())
                    .with_param("template", json!(space))
                    .with_resources(self.resources(4.0))
                    .with_tag(ANAT_TAG),
            );
        }
        steps.push(
            Step::new(name("anat_seg"), self.action("anat_seg"))
                .with_input_from("brain", name("brain_extraction"), "brain")
                .with_input_from(
                    "xfm",
                    name(&format!("anat_norm_{}", self.primary_space())),
                    "xfm",
                )
                .with_output(ArtifactDescriptor::file("dseg"))
                .with_output(ArtifactDescriptor::file_set("tpms"))
                .with_resources(self.resources(2.0))
                .with_tag(ANAT_TAG),
        );

        let mut sink = Step::new(
            name("derivatives_anat"),
            Arc::new(DerivativesAction::new(
                &self.options.output_dir,
                &subject.label,
                "anat",
            )),
        )
        .with_input_from(format!("desc-preproc_{contrast}"), name("brain_extraction"), "brain")
        .with_input_from("desc-brain_mask", name("brain_extraction"), "mask");
        for space in &self.options.templates {
            sink = sink.with_input_from(
                format!("space-{space}_desc-preproc_{contrast}"),
                name(&format!("anat_norm_{space}")),
                "standardized",
            );
        }
        steps.push(
            sink.with_input_from("dseg", name("anat_seg"), "dseg")
                .with_input_from("label-tpm_probseg", name("anat_seg"), "tpms")
                .with_output(ArtifactDescriptor::file_set("files"))
                .with_param("output_dir", json!(self.options.output_dir))
                .with_tag(ANAT_TAG)
                .inline(),
        );
        steps
    }

    fn bold_steps(&self, subject: &Subject, run: &BoldRun) -> Vec<Step> {
        let sub = format!("sub-{}", subject.label);
        let anat = |kind: &str| format!("{sub}/{kind}");
        let name = |kind: &str| format!("{sub}/{}/{kind}", run.label());

        let reference = Step::new(name("bold_reference"), self.action("bold_reference"))
            .with_external_input("bold", &run.path);
        let mut steps = vec![
            self.validated(reference)
                .with_output(ArtifactDescriptor::file("boldref"))
                .with_resources(self.resources(1.0)),
            Step::new(name("bold_hmc"), self.action("bold_hmc"))
                .with_external_input("bold", &run.path)
                .with_input_from("boldref", name("bold_reference"), "boldref")
                .with_output(ArtifactDescriptor::file("xforms"))
                .with_output(ArtifactDescriptor::file("movpar"))
                .with_resources(self.resources(1.0)),
            Step::new(name("bold_coreg"), self.action("bold_coreg"))
                .with_input_from("boldref", name("bold_reference"), "boldref")
                .with_input_from("anat_brain", anat("brain_extraction"), "brain")
                .with_output(ArtifactDescriptor::file("bold2anat"))
                .with_param("sloppy", json!(self.options.sloppy))
                .with_resources(self.resources(2.0)),
        ];
        for space in &self.options.templates {
            steps.push(
                Step::new(name(&format!("bold_std_{space}")), self.action("bold_std"))
                    .with_external_input("bold", &run.path)
                    .with_input_from("bold2anat", name("bold_coreg"), "bold2anat")
                    .with_input_from("hmc_xforms", name("bold_hmc"), "xforms")
                    .with_input_from("std_xfm", anat(&format!("anat_norm_{space}")), "xfm")
                    .with_output(ArtifactDescriptor::file("bold_std"))
                    .with_param("template", json!(space))
                    .with_resources(self.resources(4.0)),
            );
        }
        steps.push(
            Step::new(name("bold_confounds"), self.action("bold_confounds"))
                .with_external_input("bold", &run.path)
                .with_input_from("movpar", name("bold_hmc"), "movpar")
                .with_input_from("bold2anat", name("bold_coreg"), "bold2anat")
                .with_input_from("dseg", anat("anat_seg"), "dseg")
                .with_output(ArtifactDescriptor::file("confounds"))
                .with_resources(self.resources(1.0)),
        );
        steps
    }

    fn func_derivatives(&self, subject: &Subject) -> Step {
        let sub = format!("sub-{}", subject.label);
        let mut step = Step::new(
            format!("{sub}/derivatives_func"),
            Arc::new(DerivativesAction::new(
                &self.options.output_dir,
                &subject.label,
                "func",
            )),
        );
        for run in &subject.bold {
            let prefix = format!("{sub}/{}", run.label());
            for space in &self.options.templates {
                step = step.with_input_from(
                    format!("{}_space-{space}_desc-preproc_bold", run.label()),
                    format!("{prefix}/bold_std_{space}"),
                    "bold_std",
                );
            }
            step = step.with_input_from(
                format!("{}_desc-confounds_timeseries", run.label()),
                format!("{prefix}/bold_confounds"),
                "confounds",
            );
        }
        step.with_output(ArtifactDescriptor::file_set("files"))
            .with_param("output_dir", json!(self.options.output_dir))
            .inline()
    }
}
