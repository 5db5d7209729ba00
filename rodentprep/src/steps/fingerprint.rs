//! Content fingerprints for steps.
//!
//! A step's fingerprint is a SHA-256 over a canonical JSON document holding
//! the step name, the action id and version, the declared outputs, the
//! configuration parameters and one digest per input. Artifact inputs
//! contribute their producer's fingerprint, so any change upstream
//! propagates to every descendant. External inputs contribute a digest of
//! the file (content or size+mtime, depending on [`HashMethod`]).
//!
//! Directory inputs are walked without following links to directories, and
//! hidden entries (`.git`, `.datalad`) are left out.

use super::{InputSource, Step};
use crate::errors::EngineError;
use crate::graph::Graph;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// A deterministic content hash identifying a step's cacheable result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an existing hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix for log lines and directory names.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How external input files are digested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMethod {
    /// Hash file contents.
    #[default]
    Content,
    /// Hash file size and modification time.
    Timestamp,
}

impl FromStr for HashMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "timestamp" => Ok(Self::Timestamp),
            other => Err(format!("unknown hash method '{other}'")),
        }
    }
}

impl fmt::Display for HashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Computes a step fingerprint from already-digested inputs.
///
/// `input_digests` must be in the step's declared input order.
#[must_use]
pub fn step_fingerprint(step: &Step, input_digests: &[String]) -> Fingerprint {
    let inputs: Vec<serde_json::Value> = step
        .inputs
        .iter()
        .zip(input_digests)
        .map(|(input, digest)| serde_json::json!([input.name, digest]))
        .collect();

    let canonical = serde_json::json!({
        "step": step.name,
        "action": step.action.id(),
        "version": step.action.version(),
        "inputs": inputs,
        "outputs": step.outputs,
        "params": step.params,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Computes the fingerprint of every step, indexed by step id.
///
/// # Errors
///
/// Fails if an external input cannot be read.
pub async fn fingerprint_graph(
    graph: &Graph,
    method: HashMethod,
) -> Result<Vec<Fingerprint>, EngineError> {
    let mut external: HashMap<PathBuf, String> = HashMap::new();
    let mut fingerprints: Vec<Option<Fingerprint>> = vec![None; graph.len()];

    for &id in graph.topological_order() {
        let step = graph.step(id);
        let mut digests = Vec::with_capacity(step.inputs.len());

        for input in &step.inputs {
            let digest = match &input.source {
                InputSource::Artifact { step: producer, output } => {
                    let producer_fp = graph
                        .id_of(producer)
                        .and_then(|pid| fingerprints[pid].as_ref())
                        .ok_or_else(|| {
                            EngineError::Internal(format!(
                                "producer '{producer}' of '{}' has no fingerprint",
                                step.name
                            ))
                        })?;
                    format!("artifact:{producer_fp}:{output}")
                }
                InputSource::External(path) => {
                    if let Some(d) = external.get(path) {
                        d.clone()
                    } else {
                        let d = digest_external(path.clone(), method).await?;
                        external.insert(path.clone(), d.clone());
                        d
                    }
                }
                InputSource::Value(value) => format!("value:{value}"),
            };
            digests.push(digest);
        }

        let fp = step_fingerprint(step, &digests);
        debug!(step = %step.name, fingerprint = %fp.short(), "Computed fingerprint");
        fingerprints[id] = Some(fp);
    }

    fingerprints
        .into_iter()
        .enumerate()
        .map(|(id, fp)| {
            fp.ok_or_else(|| {
                EngineError::Internal(format!("step '{}' was never fingerprinted", graph.step(id).name))
            })
        })
        .collect()
}

/// Digests an external file or directory on the blocking pool.
async fn digest_external(path: PathBuf, method: HashMethod) -> Result<String, EngineError> {
    tokio::task::spawn_blocking(move || {
        let meta = std::fs::metadata(&path).map_err(unreadable(&path))?;
        let mut hasher = Sha256::new();
        hash_path(&path, &path, &meta, method, &mut hasher)?;
        Ok::<_, EngineError>(format!("{method}:{}", hex::encode(hasher.finalize())))
    })
    .await
    .map_err(|e| EngineError::Internal(format!("hash task join error: {e}")))?
}

fn unreadable(path: &Path) -> impl FnOnce(io::Error) -> EngineError + '_ {
    move |source| EngineError::ExternalInput {
        path: path.to_path_buf(),
        source,
    }
}

fn hash_path(
    root: &Path,
    path: &Path,
    meta: &std::fs::Metadata,
    method: HashMethod,
    hasher: &mut Sha256,
) -> Result<(), EngineError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update(b"\0");

    if meta.is_dir() {
        let mut children: Vec<PathBuf> = std::fs::read_dir(path)
            .and_then(|entries| {
                entries
                    .map(|entry| entry.map(|e| e.path()))
                    .collect::<io::Result<Vec<_>>>()
            })
            .map_err(unreadable(path))?;
        children.retain(|child| !is_hidden(child));
        children.sort();
        for child in children {
            let link = std::fs::symlink_metadata(&child).map_err(unreadable(&child))?;
            if !link.file_type().is_symlink() {
                hash_path(root, &child, &link, method, hasher)?;
                continue;
            }
            // Links to files are hashed through; links to directories and
            // dangling links contribute their target only.
            match std::fs::metadata(&child) {
                Ok(target) if target.is_file() => hash_path(root, &child, &target, method, hasher)?,
                _ => {
                    let target = std::fs::read_link(&child).map_err(unreadable(&child))?;
                    let relative = child.strip_prefix(root).unwrap_or(&child);
                    hasher.update(relative.to_string_lossy().as_bytes());
                    hasher.update(b" -> ");
                    hasher.update(target.to_string_lossy().as_bytes());
                    hasher.update(b"\0");
                }
            }
        }
        return Ok(());
    }

    match method {
        HashMethod::Content => {
            let mut file = std::fs::File::open(path).map_err(unreadable(path))?;
            io::copy(&mut file, hasher).map_err(unreadable(path))?;
        }
        HashMethod::Timestamp => {
            let mtime = meta
                .modified()
                .map_err(unreadable(path))?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            hasher.update(meta.len().to_le_bytes());
            hasher.update(mtime.to_le_bytes());
        }
    }
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}
