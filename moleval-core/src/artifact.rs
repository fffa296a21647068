//! Write-once metrics artifacts at `<metrics_root>/<model>/<index>.json`.

use crate::checkpoint::CheckpointId;
use crate::collaborators::MetricsMap;
use crate::device::Device;
use crate::error::EvalError;
use crate::persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const ARTIFACT_EXTENSION: &str = "json";

/// How an artifact was produced, for reproducing it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationProvenance {
    pub checkpoint_path: PathBuf,
    pub device: Device,
    pub n_jobs: usize,
    pub seed: u64,
    pub batch_size: usize,
    pub n_batches: usize,
    pub sample_size: usize,
    /// Fingerprint of the reference dataset scored against.
    pub reference_fingerprint: String,
    pub evaluated_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Persisted result for one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsArtifact {
    pub model_name: String,
    pub checkpoint_index: u64,
    pub metrics: MetricsMap,
    pub provenance: EvaluationProvenance,
}

impl MetricsArtifact {
    pub fn id(&self) -> CheckpointId {
        CheckpointId::new(self.model_name.clone(), self.checkpoint_index)
    }
}

/// Filesystem store for metrics artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic artifact path for a checkpoint.
    pub fn path_for(&self, id: &CheckpointId) -> PathBuf {
        self.root
            .join(&id.model_name)
            .join(format!("{}.{ARTIFACT_EXTENSION}", id.index))
    }

    pub fn exists(&self, id: &CheckpointId) -> bool {
        self.path_for(id).exists()
    }

    /// Persist an artifact.
    ///
    /// Without `overwrite` the file is created exclusively and an existing
    /// artifact yields `EvalError::AlreadyExists`, leaving it untouched. With
    /// `overwrite` the artifact is replaced atomically.
    pub fn write(&self, artifact: &MetricsArtifact, overwrite: bool) -> Result<PathBuf, EvalError> {
        let path = self.path_for(&artifact.id());
        if overwrite {
            persistence::atomic_write_json(&path, artifact)?;
        } else {
            persistence::create_new_json(&path, artifact).map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    EvalError::AlreadyExists { path: path.clone() }
                } else {
                    EvalError::Io(e)
                }
            })?;
        }
        debug!(path = %path.display(), "Wrote metrics artifact");
        Ok(path)
    }

    pub fn load(&self, id: &CheckpointId) -> Result<Option<MetricsArtifact>, EvalError> {
        Ok(persistence::load_json(&self.path_for(id))?)
    }

    /// Every artifact under the root, sorted by model then index.
    ///
    /// Files that do not follow the `<model>/<index>.json` layout are ignored.
    /// Symlinked model directories are followed.
    pub fn list(&self) -> Result<Vec<MetricsArtifact>, EvalError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .min_depth(2)
            .max_depth(2)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() > 0 => {
                    warn!(error = %e, "Skipping unreadable metrics entry");
                    continue;
                }
                Err(e) => return Err(EvalError::Io(e.into())),
            };
            let path = entry.path();
            let is_artifact = entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.parse::<u64>().is_ok());
            if !is_artifact {
                continue;
            }
            if let Some(artifact) = persistence::load_json::<MetricsArtifact>(path)? {
                artifacts.push(artifact);
            }
        }

        artifacts.sort_by(|a, b| {
            (a.model_name.as_str(), a.checkpoint_index)
                .cmp(&(b.model_name.as_str(), b.checkpoint_index))
        });
        Ok(artifacts)
    }
}
