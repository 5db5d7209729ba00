//! Post-run cleanup of failed outputs.
//!
//! Large volumetric images left by failed steps are truncated in place:
//! the paths stay for diagnostic tooling, the storage is freed.

use super::RunReport;
use crate::errors::EngineError;
use crate::store::ArtifactStore;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File suffixes treated as volumetric images.
pub const VOLUMETRIC_SUFFIXES: &[&str] = &[".nii", ".nii.gz", ".mgz", ".h5"];

/// Returns true if `path` names a volumetric image.
#[must_use]
pub fn is_volumetric(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|name| VOLUMETRIC_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
}

/// Truncates every volumetric image the report lists as indeterminate to
/// zero length. Returns the truncated paths.
///
/// # Errors
///
/// Fails on the first file that exists but cannot be truncated.
pub async fn truncate_indeterminate(report: &RunReport) -> Result<Vec<PathBuf>, EngineError> {
    let mut truncated = Vec::new();
    for path in report.indeterminate.iter().filter(|p| is_volumetric(p)) {
        match tokio::fs::OpenOptions::new().write(true).truncate(true).open(path).await {
            Ok(_) => {
                debug!(path = %path.display(), "Truncated indeterminate output");
                truncated.push(path.clone());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    info!(files = truncated.len(), "Truncated failed outputs");
    Ok(truncated)
}

/// Removes the failed cache entries of steps whose own action failed.
/// Returns how many entries were removed.
///
/// # Errors
///
/// Fails if the store cannot remove an entry.
pub async fn invalidate_failed(report: &RunReport, store: &dyn ArtifactStore) -> Result<usize, EngineError> {
    let mut removed = 0;
    for step in report.own_failures() {
        if store.invalidate(&step.fingerprint).await? {
            debug!(step = %step.name, "Removed failed cache entry");
            removed += 1;
        }
    }
    info!(entries = removed, "Cleaned failed cache entries");
    Ok(removed)
}
