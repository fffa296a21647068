//! Checkpoint discovery.
//!
//! Checkpoints live at `<root>/<model-name>/<prefix>_<index>.<ext>`. Files
//! whose name carries no parseable index are filtered out silently.

use crate::error::EvalError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*_(\d+)\.[^.]+$").expect("checkpoint index pattern is valid")
});

/// Identity of a checkpoint: model name plus integer index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId {
    pub model_name: String,
    pub index: u64,
}

impl CheckpointId {
    pub fn new(model_name: impl Into<String>, index: u64) -> Self {
        Self {
            model_name: model_name.into(),
            index,
        }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_name, self.index)
    }
}

/// A discovered checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub path: PathBuf,
}

/// Extract the index from a checkpoint file name such as `checkpoint_10.pt`.
///
/// Returns `None` for any name that does not end in `_<digits>.<ext>` or whose
/// digits overflow `u64`.
pub fn parse_checkpoint_index(file_name: &str) -> Option<u64> {
    INDEX_RE
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Enumerate every evaluable checkpoint under `root`.
///
/// Only files exactly two levels down (`<root>/<model>/<file>`) are
/// considered. Symlinked model directories and checkpoint files are followed
/// and reported under their link path; dangling links are skipped. A missing
/// root yields an empty list. The result is sorted by model name, then index.
pub fn discover_checkpoints(root: &Path) -> Result<Vec<Checkpoint>, EvalError> {
    if !root.exists() {
        debug!(root = %root.display(), "Checkpoint root does not exist");
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).min_depth(2).max_depth(2) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() > 0 => {
                warn!(error = %e, "Skipping unreadable checkpoint entry");
                continue;
            }
            Err(e) => return Err(EvalError::Io(e.into())),
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(model_name) = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        else {
            continue;
        };
        let Some(index) = entry.file_name().to_str().and_then(parse_checkpoint_index) else {
            trace!(path = %entry.path().display(), "Skipping file without checkpoint index");
            continue;
        };

        found.push(Checkpoint {
            id: CheckpointId::new(model_name, index),
            path: entry.path().to_path_buf(),
        });
    }

    found.sort_by(|a, b| a.id.cmp(&b.id));
    debug!(root = %root.display(), count = found.len(), "Discovered checkpoints");
    Ok(found)
}

/// Keep only checkpoints of the named models. An empty filter keeps all.
pub fn filter_models(checkpoints: Vec<Checkpoint>, models: &[String]) -> Vec<Checkpoint> {
    if models.is_empty() {
        return checkpoints;
    }
    checkpoints
        .into_iter()
        .filter(|c| models.iter().any(|m| m == &c.id.model_name))
        .collect()
}

/// Locate one checkpoint by identity.
pub fn find_checkpoint(root: &Path, id: &CheckpointId) -> Result<Checkpoint, EvalError> {
    discover_checkpoints(root)?
        .into_iter()
        .find(|c| &c.id == id)
        .ok_or_else(|| EvalError::not_found(format!("checkpoint {id} under '{}'", root.display())))
}
