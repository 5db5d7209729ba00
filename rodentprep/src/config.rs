//! Engine configuration loaded from YAML.
//!
//! ```yaml
//! execution:
//!   stop_on_first_crash: true
//!   poll_sleep_duration: 0.5
//!   hash_method: content
//! tools:
//!   brain_extraction:
//!     program: antsBrainExtraction.sh
//!     args: ["-d", "3", "-a", "{in:anat}", "-o", "{outdir}/"]
//!     outputs:
//!       brain: BrainExtractionBrain.nii.gz
//!       mask: BrainExtractionMask.nii.gz
//! ```

use crate::errors::ConfigError;
use crate::scheduler::CrashPolicy;
use crate::steps::HashMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_POLL_SLEEP: Duration = Duration::from_millis(500);

/// Execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Stop admitting steps after the first failure.
    pub stop_on_first_crash: bool,
    /// Seconds the executor idles between ready-queue checks.
    pub poll_sleep_duration: f64,
    /// How external inputs are digested.
    pub hash_method: HashMethod,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stop_on_first_crash: true,
            poll_sleep_duration: 0.5,
            hash_method: HashMethod::Content,
        }
    }
}

impl ExecutionConfig {
    /// The idle poll interval. Values [`EngineConfig::validate`] rejects fall
    /// back to the default.
    #[must_use]
    pub fn poll_sleep(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_sleep_duration)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_POLL_SLEEP)
    }

    /// The crash policy.
    #[must_use]
    pub fn crash_policy(&self) -> CrashPolicy {
        CrashPolicy::from_stop_on_first_crash(self.stop_on_first_crash)
    }
}

/// Where a tool writes a declared output, relative to the step's output
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    /// A single file.
    One(String),
    /// Several files, for file-set outputs.
    Many(Vec<String>),
}

impl ToolOutput {
    /// Returns the file names.
    #[must_use]
    pub fn files(&self) -> Vec<&str> {
        match self {
            Self::One(f) => vec![f.as_str()],
            Self::Many(fs) => fs.iter().map(String::as_str).collect(),
        }
    }
}

/// An external program that implements a step.
///
/// Arguments may contain placeholders: `{in:<input>}`, `{out:<output>}`,
/// `{param:<name>}`, `{outdir}`, `{omp_nthreads}` and `{license}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Executable name or path.
    pub program: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Output files keyed by declared output name.
    #[serde(default)]
    pub outputs: BTreeMap<String, ToolOutput>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Execution settings.
    pub execution: ExecutionConfig,
    /// Tools keyed by step kind (e.g. `brain_extraction`).
    pub tools: BTreeMap<String, ToolConfig>,
}

impl EngineConfig {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Fails if the document does not match the schema or a value is out of
    /// range.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll = self.execution.poll_sleep_duration;
        if !poll.is_finite() || poll <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "execution.poll_sleep_duration must be a positive number of seconds, got {poll}"
            )));
        }
        if Duration::try_from_secs_f64(poll).is_err() {
            return Err(ConfigError::Invalid(format!(
                "execution.poll_sleep_duration is out of range, got {poll}"
            )));
        }
        for (kind, tool) in &self.tools {
            if tool.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("tools.{kind}.program is empty")));
            }
            if let Some((name, _)) = tool.outputs.iter().find(|(_, o)| o.files().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "tools.{kind}.outputs.{name} lists no files"
                )));
            }
        }
        Ok(())
    }

    /// Returns the tool configured for a step kind.
    #[must_use]
    pub fn tool(&self, kind: &str) -> Option<&ToolConfig> {
        self.tools.get(kind)
    }
}
