//! Minimal BIDS dataset discovery.
//!
//! Only what the preprocessing workflow consumes is indexed: anatomical
//! (`T2w` and `T1w`) and functional (`bold`) NIfTI images per subject,
//! optionally nested in session directories.

use crate::errors::EngineError;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^sub-(?P<sub>[A-Za-z0-9]+)(?P<entities>(?:_[A-Za-z]+-[A-Za-z0-9]+)*)_(?P<suffix>T1w|T2w|bold)\.nii(?:\.gz)?$",
    )
    .expect("BIDS image pattern is valid")
});

/// One functional run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoldRun {
    /// Entities between the subject label and the suffix, e.g.
    /// `ses-1_task-rest_run-01`.
    pub entities: String,
    /// The image path.
    pub path: PathBuf,
}

impl BoldRun {
    /// A short identifier unique within the subject.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.entities.is_empty() {
            "bold"
        } else {
            &self.entities
        }
    }
}

/// The images of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subject {
    /// Label without the `sub-` prefix.
    pub label: String,
    /// T2-weighted images, across sessions.
    pub t2w: Vec<PathBuf>,
    /// T1-weighted images, across sessions.
    pub t1w: Vec<PathBuf>,
    /// Functional runs.
    pub bold: Vec<BoldRun>,
}

impl Subject {
    /// The contrast the anatomical reference is built from and all of its
    /// images. T2w is preferred; contrasts are never mixed.
    #[must_use]
    pub fn reference_images(&self) -> Option<(&'static str, &[PathBuf])> {
        if !self.t2w.is_empty() {
            Some(("T2w", &self.t2w))
        } else if !self.t1w.is_empty() {
            Some(("T1w", &self.t1w))
        } else {
            None
        }
    }
}

/// An indexed dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidsDataset {
    /// Dataset root.
    pub root: PathBuf,
    /// Subjects, ordered by label.
    pub subjects: Vec<Subject>,
}

/// Strips an optional `sub-` prefix from a participant label.
#[must_use]
pub fn normalize_label(label: &str) -> &str {
    label.strip_prefix("sub-").unwrap_or(label)
}

impl BidsDataset {
    /// Indexes `root`, keeping only `participants` if any are given.
    ///
    /// # Errors
    ///
    /// Fails if the root is unreadable, a requested participant is absent,
    /// or no subject remains.
    pub async fn discover(root: &Path, participants: &[String]) -> Result<Self, EngineError> {
        let root = root.to_path_buf();
        let wanted: Vec<String> = participants.iter().map(|p| normalize_label(p).to_string()).collect();
        tokio::task::spawn_blocking(move || Self::discover_blocking(root, &wanted))
            .await
            .map_err(|e| EngineError::Internal(format!("dataset scan join error: {e}")))?
    }

    fn discover_blocking(root: PathBuf, wanted: &[String]) -> Result<Self, EngineError> {
        if !root.is_dir() {
            return Err(EngineError::Dataset(format!("{} is not a directory", root.display())));
        }

        let mut subjects: BTreeMap<String, Subject> = BTreeMap::new();

        for subject_dir in sorted_dirs(&root, "sub-")? {
            let mut datatype_dirs = Vec::new();
            for child in sorted_dirs(&subject_dir, "")? {
                let name = child.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                if name.starts_with("ses-") {
                    datatype_dirs.extend(sorted_dirs(&child, "")?);
                } else {
                    datatype_dirs.push(child);
                }
            }

            for dir in datatype_dirs {
                for file in sorted_files(&dir)? {
                    let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                    let Some(caps) = IMAGE_PATTERN.captures(&name) else {
                        continue;
                    };
                    let label = caps["sub"].to_string();
                    let subject = subjects.entry(label.clone()).or_insert_with(|| Subject {
                        label: label.clone(),
                        ..Subject::default()
                    });
                    match &caps["suffix"] {
                        "T2w" => subject.t2w.push(file.clone()),
                        "T1w" => subject.t1w.push(file.clone()),
                        _ => subject.bold.push(BoldRun {
                            entities: caps["entities"].trim_start_matches('_').to_string(),
                            path: file.clone(),
                        }),
                    }
                }
            }
        }

        if !wanted.is_empty() {
            if let Some(missing) = wanted.iter().find(|w| !subjects.contains_key(*w)) {
                return Err(EngineError::Dataset(format!("participant 'sub-{missing}' not found")));
            }
            subjects.retain(|label, _| wanted.contains(label));
        }

        for subject in subjects.values() {
            if subject.reference_images().is_none() {
                warn!(subject = %subject.label, "No anatomical image found");
            }
            debug!(
                subject = %subject.label,
                t2w = subject.t2w.len(),
                t1w = subject.t1w.len(),
                bold = subject.bold.len(),
                "Indexed subject"
            );
        }

        if subjects.is_empty() {
            return Err(EngineError::Dataset(format!("no subjects found under {}", root.display())));
        }

        Ok(Self {
            root,
            subjects: subjects.into_values().collect(),
        })
    }
}

fn sorted_dirs(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, EngineError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with(prefix)))
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}
