//! Artifact descriptors and values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// The shape of an artifact a step produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A single file.
    File,
    /// An ordered set of files.
    FileSet,
    /// A summary value (JSON).
    Value,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::FileSet => write!(f, "file_set"),
            Self::Value => write!(f, "value"),
        }
    }
}

/// A named, typed output declared by a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Output name, unique within the producing step.
    pub name: String,
    /// Output kind.
    pub kind: ArtifactKind,
}

impl ArtifactDescriptor {
    /// Declares a single-file output.
    #[must_use]
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::File,
        }
    }

    /// Declares a file-set output.
    #[must_use]
    pub fn file_set(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::FileSet,
        }
    }

    /// Declares a summary value output.
    #[must_use]
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::Value,
        }
    }
}

/// A materialised artifact: where it lives or what it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactValue {
    /// A single file.
    File(PathBuf),
    /// An ordered set of files.
    FileSet(Vec<PathBuf>),
    /// A summary value.
    Value(serde_json::Value),
}

impl ArtifactValue {
    /// Returns the kind of this value.
    #[must_use]
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::File(_) => ArtifactKind::File,
            Self::FileSet(_) => ArtifactKind::FileSet,
            Self::Value(_) => ArtifactKind::Value,
        }
    }

    /// Returns every file path referenced by this value.
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::File(p) => vec![p.as_path()],
            Self::FileSet(ps) => ps.iter().map(PathBuf::as_path).collect(),
            Self::Value(_) => Vec::new(),
        }
    }

    /// Returns the single file path, if this is a file artifact.
    #[must_use]
    pub fn as_file(&self) -> Option<&Path> {
        match self {
            Self::File(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the first path of a file or file-set artifact.
    #[must_use]
    pub fn primary_path(&self) -> Option<&Path> {
        self.paths().into_iter().next()
    }

    /// Returns the first referenced path that does not exist on disk.
    #[must_use]
    pub fn first_missing_path(&self) -> Option<&Path> {
        self.paths().into_iter().find(|p| !p.exists())
    }
}

/// Artifacts keyed by output name, in stable order.
pub type ArtifactMap = BTreeMap<String, ArtifactValue>;
