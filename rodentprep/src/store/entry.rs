//! Cache entries.

use crate::core::ArtifactMap;
use crate::errors::StepError;
use crate::steps::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome recorded for a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// The step ran and produced every declared output.
    Success,
    /// The step ran and failed.
    Failed,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted record of a step's outcome, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The step fingerprint.
    pub fingerprint: Fingerprint,
    /// The step name, for diagnostics only.
    pub step: String,
    /// Success or failure.
    pub status: CacheStatus,
    /// Artifact locations (empty on failure).
    #[serde(default)]
    pub outputs: ArtifactMap,
    /// Why the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// When the entry was created.
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a success entry.
    #[must_use]
    pub fn success(fingerprint: Fingerprint, step: impl Into<String>, outputs: ArtifactMap) -> Self {
        Self {
            fingerprint,
            step: step.into(),
            status: CacheStatus::Success,
            outputs,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a failure entry.
    #[must_use]
    pub fn failed(fingerprint: Fingerprint, step: impl Into<String>, error: StepError) -> Self {
        Self {
            fingerprint,
            step: step.into(),
            status: CacheStatus::Failed,
            outputs: ArtifactMap::new(),
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    /// Returns true if this entry records a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CacheStatus::Success
    }
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// This writer published the entry.
    Committed,
    /// Another writer published first; its entry is authoritative.
    AlreadyCommitted(CacheEntry),
}

impl CommitOutcome {
    /// Returns true if this writer won.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}
