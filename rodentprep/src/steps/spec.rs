//! Step specifications.

use super::StepAction;
use crate::core::{ArtifactDescriptor, ResourceRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Where a step input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// An artifact declared by another step.
    Artifact {
        /// The producing step.
        step: String,
        /// The producer's output name.
        output: String,
    },
    /// A file or directory outside the workflow, such as a raw dataset file.
    External(PathBuf),
    /// A literal value.
    Value(serde_json::Value),
}

/// A named input declared by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    /// The input name the action looks up.
    pub name: String,
    /// Where the input comes from.
    pub source: InputSource,
}

/// Specification for a single step in a workflow.
#[derive(Debug, Clone)]
pub struct Step {
    /// The unique name of the step.
    pub name: String,
    /// The algorithm the step runs.
    pub action: Arc<dyn StepAction>,
    /// Declared inputs, in order.
    pub inputs: Vec<StepInput>,
    /// Declared outputs, in order.
    pub outputs: Vec<ArtifactDescriptor>,
    /// Resources reserved while the step runs.
    pub resources: ResourceRequest,
    /// Configuration values the action depends on.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Free-form labels used to select subgraphs.
    pub tags: BTreeSet<String>,
    /// Runs without reserving resource slots.
    pub inline: bool,
}

impl Step {
    /// Creates a new step specification.
    #[must_use]
    pub fn new(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            action,
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourceRequest::default(),
            params: BTreeMap::new(),
            tags: BTreeSet::new(),
            inline: false,
        }
    }

    /// Adds an input produced by another step.
    #[must_use]
    pub fn with_input_from(
        mut self,
        name: impl Into<String>,
        step: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.inputs.push(StepInput {
            name: name.into(),
            source: InputSource::Artifact {
                step: step.into(),
                output: output.into(),
            },
        });
        self
    }

    /// Adds an external file input.
    #[must_use]
    pub fn with_external_input(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(StepInput {
            name: name.into(),
            source: InputSource::External(path.into()),
        });
        self
    }

    /// Adds a literal value input.
    #[must_use]
    pub fn with_value_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.push(StepInput {
            name: name.into(),
            source: InputSource::Value(value),
        });
        self
    }

    /// Declares an output.
    #[must_use]
    pub fn with_output(mut self, output: ArtifactDescriptor) -> Self {
        self.outputs.push(output);
        self
    }

    /// Sets the resource request.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Adds a configuration parameter that the action depends on.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Marks the step as inline: it runs without reserving resource slots.
    #[must_use]
    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    /// Returns true if the step carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the names of steps this step consumes artifacts from, in
    /// declaration order and without repeats.
    #[must_use]
    pub fn upstream_steps(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.inputs
            .iter()
            .filter_map(|input| match &input.source {
                InputSource::Artifact { step, .. } => Some(step.as_str()),
                _ => None,
            })
            .filter(|step| seen.insert(*step))
            .collect()
    }

    /// Returns the declared output with the given name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&ArtifactDescriptor> {
        self.outputs.iter().find(|o| o.name == name)
    }
}
